use std::{path::PathBuf, time::Duration};

use crate::dispatch::DEFAULT_TIMEOUT;

/**
 * \brief 进程级配置，启动时由环境变量构建一次。
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    /** \brief SQLite 数据库文件 */
    pub db_path: PathBuf,
    /** \brief 默认密钥文件 */
    pub env_file: PathBuf,
    /** \brief 本地覆盖密钥文件，同名键优先 */
    pub env_local_file: PathBuf,
    /** \brief telemetry 日志目录 */
    pub log_dir: PathBuf,
    /** \brief 单次调用超时 */
    pub request_timeout: Duration,
    /** \brief `serve` 使用的静态页面目录 */
    pub ui_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("chatlist.db"),
            env_file: PathBuf::from(".env"),
            env_local_file: PathBuf::from(".env.local"),
            log_dir: PathBuf::from("logs"),
            request_timeout: DEFAULT_TIMEOUT,
            ui_dir: PathBuf::from("web"),
        }
    }
}

impl AppConfig {
    /**
     * \brief 读取 `CHATLIST_*` 环境变量，缺省值见 `Default`。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let path = |key: &str, fallback: PathBuf| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };
        let request_timeout = lookup("CHATLIST_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        Self {
            db_path: path("CHATLIST_DB", defaults.db_path),
            env_file: path("CHATLIST_ENV_FILE", defaults.env_file),
            env_local_file: path("CHATLIST_ENV_LOCAL_FILE", defaults.env_local_file),
            log_dir: path("CHATLIST_LOG_DIR", defaults.log_dir),
            request_timeout,
            ui_dir: path("CHATLIST_UI_DIR", defaults.ui_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let cfg = AppConfig::from_lookup(|_| None);
        assert_eq!(cfg.db_path, PathBuf::from("chatlist.db"));
        assert_eq!(cfg.env_local_file, PathBuf::from(".env.local"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides_and_invalid_timeout() {
        let vars: HashMap<&str, &str> = [
            ("CHATLIST_DB", "/tmp/x.db"),
            ("CHATLIST_TIMEOUT_SECS", "15"),
            ("CHATLIST_LOG_DIR", "  "),
        ]
        .into_iter()
        .collect();
        let cfg = AppConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(15));
        assert_eq!(cfg.log_dir, PathBuf::from("logs"));

        let cfg = AppConfig::from_lookup(|k| (k == "CHATLIST_TIMEOUT_SECS").then(|| "0".into()));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
    }
}
