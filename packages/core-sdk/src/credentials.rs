use std::{collections::HashMap, fmt, path::Path};

use anyhow::{Context, Result};

/**
 * \brief 凭据解析器：按逻辑名称查找 API Key。
 * \details 启动时一次性构建，之后只读；分发期间无需加锁即可在任务间共享。
 *          Debug 输出只包含键名。
 */
#[derive(Clone, Default)]
pub struct CredentialStore {
    values: HashMap<String, String>,
}

impl CredentialStore {
    /**
     * \brief 按 `.env` → `.env.local` → 进程环境变量的顺序叠加，后者覆盖前者。
     * \details 不修改进程环境；文件不存在时忽略。键或值不是合法 UTF-8 的变量被跳过。
     */
    pub fn load(env_file: &Path, env_local_file: &Path) -> Result<Self> {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        Self::load_with(env_file, env_local_file, vars)
    }

    /**
     * \brief 同 `load`，但进程环境由调用方提供。
     */
    pub fn load_with<I>(env_file: &Path, env_local_file: &Path, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut store = Self::from_files(&[env_file, env_local_file])?;
        store.values.extend(vars);
        Ok(store)
    }

    /**
     * \brief 仅从 key=value 文件构建，越靠后的文件优先级越高。
     */
    pub fn from_files(paths: &[&Path]) -> Result<Self> {
        let mut values = HashMap::new();
        for path in paths {
            merge_file(&mut values, path)?;
        }
        Ok(Self { values })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /**
     * \brief 解析凭据；未定义或值为空均视为不存在。
     */
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("CredentialStore")
            .field("keys", &keys)
            .finish()
    }
}

fn merge_file(values: &mut HashMap<String, String>, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("read secrets file {} failed", path.display()))?;
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("parse secrets file {} failed", path.display()))?;
        values.insert(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_env(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create env file");
        file.write_all(body.as_bytes()).expect("write env file");
        path
    }

    #[test]
    fn test_local_override_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = write_env(&dir, ".env", "KEY1=base\nKEY2=only-base\n");
        let local = write_env(&dir, ".env.local", "KEY1=local\n");
        let store = CredentialStore::from_files(&[&base, &local]).expect("load");
        assert_eq!(store.resolve("KEY1"), Some("local"));
        assert_eq!(store.resolve("KEY2"), Some("only-base"));
    }

    #[test]
    fn test_process_env_beats_both_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = write_env(&dir, ".env", "KEY1=base\nKEY2=base\nKEY3=base\n");
        let local = write_env(&dir, ".env.local", "KEY1=local\nKEY2=local\n");
        let vars = vec![("KEY1".to_string(), "process".to_string())];
        let store = CredentialStore::load_with(&base, &local, vars).expect("load");
        assert_eq!(store.resolve("KEY1"), Some("process"));
        assert_eq!(store.resolve("KEY2"), Some("local"));
        assert_eq!(store.resolve("KEY3"), Some("base"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_env_var_is_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let base = write_env(&dir, ".env", "KEY1=from-file\n");
        let local = dir.path().join(".env.local");
        let name = "CHATLIST_TEST_NON_UTF8_VALUE";
        std::env::set_var(name, OsStr::from_bytes(b"\xff\xfe"));
        let loaded = CredentialStore::load(&base, &local);
        std::env::remove_var(name);

        let store = loaded.expect("load");
        assert!(!store.contains(name));
        assert_eq!(store.resolve("KEY1"), Some("from-file"));
    }

    #[test]
    fn test_missing_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.env");
        let store = CredentialStore::from_files(&[&missing]).expect("load");
        assert!(!store.contains("KEY1"));
    }

    #[test]
    fn test_empty_value_is_not_a_credential() {
        let store = CredentialStore::from_pairs([("EMPTY", ""), ("SET", "sk-1")]);
        assert_eq!(store.resolve("EMPTY"), None);
        assert_eq!(store.resolve("SET"), Some("sk-1"));
    }

    #[test]
    fn test_debug_hides_values() {
        let store = CredentialStore::from_pairs([("OPENAI_API_KEY", "sk-secret")]);
        let rendered = format!("{:?}", store);
        assert!(rendered.contains("OPENAI_API_KEY"));
        assert!(!rendered.contains("sk-secret"));
    }
}
