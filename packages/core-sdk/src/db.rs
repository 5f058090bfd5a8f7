use std::{collections::BTreeMap, path::Path, thread, time::Duration};

use anyhow::{bail, Result};
use rusqlite::{params, ErrorCode, OptionalExtension};
use serde_json::Value;
use time::{macros::format_description, OffsetDateTime};

pub use rusqlite::Connection;

use crate::dispatch::DispatchOutcome;
use crate::llm::ProviderFamily;
use crate::models::{
    validate_model_input, ModelConfig, ModelPatch, NewModel, PromptRecord, StoredResult,
    ValidationError,
};

const SETTING_TELEMETRY: &str = "telemetry_enabled";
const SETTING_TIMEOUT: &str = "request_timeout_secs";
const SETTING_IMPROVER_MODEL: &str = "improver_model_id";

const MODEL_COLUMNS: &str = "id, name, api_url, api_id, model_type, is_active, created_at";

const RESULT_SELECT: &str = "SELECT r.id, r.prompt_id, r.model_id, r.response, r.saved_at, r.metadata, p.prompt, m.name
    FROM results r
    JOIN prompts p ON r.prompt_id = p.id
    JOIN models m ON r.model_id = m.id";

/**
 * \brief 打开默认数据库文件（本地目录下的 chatlist.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_db(Path::new("chatlist.db"))
}

/**
 * \brief 打开指定数据库文件并启用外键约束。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;
        CREATE TABLE IF NOT EXISTS prompts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            prompt TEXT NOT NULL,
            tags TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_prompts_date ON prompts(date);
        CREATE INDEX IF NOT EXISTS idx_prompts_tags ON prompts(tags);

        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            api_url TEXT NOT NULL,
            api_id TEXT NOT NULL,
            model_type TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_models_is_active ON models(is_active);
        CREATE INDEX IF NOT EXISTS idx_models_name ON models(name);

        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt_id INTEGER NOT NULL,
            model_id INTEGER NOT NULL,
            response TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            metadata TEXT,
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE,
            FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE RESTRICT
        );
        CREATE INDEX IF NOT EXISTS idx_results_prompt_id ON results(prompt_id);
        CREATE INDEX IF NOT EXISTS idx_results_model_id ON results(model_id);
        CREATE INDEX IF NOT EXISTS idx_results_saved_at ON results(saved_at);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 当前时间，格式 `YYYY-MM-DD HH:MM:SS`（UTC）。
 */
pub fn now_timestamp() -> Result<String> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(OffsetDateTime::now_utc().format(&format)?)
}

/**
 * \brief 校验排序参数，非法值回退到默认字段与方向。
 */
fn order_clause(
    field: &str,
    allowed: &[&str],
    default_field: &str,
    order: &str,
    default_order: &str,
) -> String {
    let field = if allowed.contains(&field) {
        field
    } else {
        default_field
    };
    let order = match order.to_ascii_uppercase().as_str() {
        "ASC" => "ASC",
        "DESC" => "DESC",
        _ => default_order,
    };
    format!("{} {}", field, order)
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

// ---------------------------------------------------------------------------
// prompts
// ---------------------------------------------------------------------------

fn map_prompt(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRecord> {
    Ok(PromptRecord {
        id: row.get(0)?,
        date: row.get(1)?,
        prompt: row.get(2)?,
        tags: row.get(3)?,
    })
}

/**
 * \brief 保存提示词。
 */
pub fn add_prompt(conn: &Connection, prompt: &str, tags: Option<&str>) -> Result<i64> {
    if prompt.trim().is_empty() {
        return Err(ValidationError("prompt must not be empty".into()).into());
    }
    let date = now_timestamp()?;
    let tags = tags.map(str::trim).filter(|t| !t.is_empty());
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO prompts (date, prompt, tags) VALUES (?1, ?2, ?3)",
            params![date, prompt, tags],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 按时间倒序列出提示词，limit 为 None 时返回全部。
 */
pub fn list_prompts(conn: &Connection, limit: Option<i64>, offset: i64) -> Result<Vec<PromptRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, date, prompt, tags FROM prompts ORDER BY date DESC, id DESC LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt
        .query_map(params![limit.unwrap_or(-1), offset], map_prompt)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按正文或标签模糊搜索。
 */
pub fn search_prompts(conn: &Connection, query: &str, limit: Option<i64>) -> Result<Vec<PromptRecord>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT id, date, prompt, tags FROM prompts
         WHERE prompt LIKE ?1 OR tags LIKE ?1
         ORDER BY date DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![pattern, limit.unwrap_or(-1)], map_prompt)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_prompt(conn: &Connection, id: i64) -> Result<Option<PromptRecord>> {
    conn.query_row(
        "SELECT id, date, prompt, tags FROM prompts WHERE id=?1",
        params![id],
        map_prompt,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 排序列出提示词；字段限 date/prompt/tags/id。
 */
pub fn sort_prompts(conn: &Connection, field: &str, order: &str) -> Result<Vec<PromptRecord>> {
    let clause = order_clause(field, &["date", "prompt", "tags", "id"], "date", order, "DESC");
    let mut stmt = conn.prepare(&format!(
        "SELECT id, date, prompt, tags FROM prompts ORDER BY {}",
        clause
    ))?;
    let rows = stmt
        .query_map([], map_prompt)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 删除提示词，关联结果级联删除。
 */
pub fn delete_prompt(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM prompts WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

// ---------------------------------------------------------------------------
// models
// ---------------------------------------------------------------------------

fn map_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelConfig> {
    let model_type: String = row.get(4)?;
    let is_active: i64 = row.get(5)?;
    Ok(ModelConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        api_url: row.get(2)?,
        api_id: row.get(3)?,
        family: ProviderFamily::from_tag_lossy(&model_type),
        is_active: is_active != 0,
        created_at: row.get(6)?,
    })
}

fn query_models(conn: &Connection, sql_tail: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ModelConfig>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM models {}", MODEL_COLUMNS, sql_tail))?;
    let rows = stmt
        .query_map(args, map_model)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 新增模型；名称重复时返回校验错误。
 */
pub fn add_model(conn: &Connection, input: &NewModel) -> Result<i64> {
    let family = validate_model_input(&input.name, &input.api_url, &input.api_id, &input.model_type)?;
    let created_at = now_timestamp()?;
    let name = input.name.trim();
    let inserted = retry_on_locked(|| {
        conn.execute(
            "INSERT INTO models (name, api_url, api_id, model_type, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                input.api_url.trim(),
                input.api_id.trim(),
                family.tag(),
                input.is_active,
                created_at
            ],
        )
    });
    match inserted {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if is_constraint_violation(&e) => {
            Err(ValidationError(format!("a model named {} already exists", name)).into())
        }
        Err(e) => Err(e),
    }
}

/**
 * \brief 列出所有模型。
 */
pub fn list_models(conn: &Connection) -> Result<Vec<ModelConfig>> {
    query_models(conn, "ORDER BY id ASC", &[])
}

/**
 * \brief 列出启用的模型（按名称排序）。
 */
pub fn list_active_models(conn: &Connection) -> Result<Vec<ModelConfig>> {
    query_models(conn, "WHERE is_active = 1 ORDER BY name", &[])
}

/**
 * \brief 按 ID 获取模型。
 */
pub fn get_model(conn: &Connection, id: i64) -> Result<Option<ModelConfig>> {
    Ok(query_models(conn, "WHERE id=?1", &[&id])?.into_iter().next())
}

pub fn get_model_by_name(conn: &Connection, name: &str) -> Result<Option<ModelConfig>> {
    Ok(query_models(conn, "WHERE name=?1", &[&name])?.into_iter().next())
}

/**
 * \brief 部分更新模型。合并后的完整记录重新校验；空补丁返回 false。
 */
pub fn update_model(conn: &Connection, id: i64, patch: &ModelPatch) -> Result<bool> {
    if patch.is_empty() {
        return Ok(false);
    }
    let Some(current) = get_model(conn, id)? else {
        bail!("model id {} not found", id);
    };
    let name = patch.name.clone().unwrap_or(current.name);
    let api_url = patch.api_url.clone().unwrap_or(current.api_url);
    let api_id = patch.api_id.clone().unwrap_or(current.api_id);
    let model_type = patch
        .model_type
        .clone()
        .unwrap_or_else(|| current.family.tag().to_string());
    let is_active = patch.is_active.unwrap_or(current.is_active);
    let family = validate_model_input(&name, &api_url, &api_id, &model_type)?;

    let updated = retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET name=?1, api_url=?2, api_id=?3, model_type=?4, is_active=?5 WHERE id=?6",
            params![name.trim(), api_url.trim(), api_id.trim(), family.tag(), is_active, id],
        )
    });
    match updated {
        Ok(rows) => Ok(rows > 0),
        Err(e) if is_constraint_violation(&e) => {
            Err(ValidationError(format!("a model named {} already exists", name.trim())).into())
        }
        Err(e) => Err(e),
    }
}

pub fn set_model_active(conn: &Connection, id: i64, active: bool) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET is_active=?1 WHERE id=?2",
            params![active, id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief 切换启用状态，返回新状态。
 */
pub fn toggle_model(conn: &Connection, id: i64) -> Result<bool> {
    let Some(model) = get_model(conn, id)? else {
        bail!("model id {} not found", id);
    };
    let next = !model.is_active;
    set_model_active(conn, id, next)?;
    Ok(next)
}

/**
 * \brief 删除模型（若存在关联结果则失败）。
 */
pub fn delete_model(conn: &Connection, id: i64) -> Result<()> {
    if get_model(conn, id)?.is_none() {
        bail!("model id {} not found", id);
    }
    let referenced: i64 = conn.query_row(
        "SELECT COUNT(*) FROM results WHERE model_id=?1",
        params![id],
        |row| row.get(0),
    )?;
    if referenced > 0 {
        bail!("cannot delete model {}: {} saved results reference it", id, referenced);
    }
    match retry_on_locked(|| conn.execute("DELETE FROM models WHERE id=?1", params![id])) {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            bail!("cannot delete model {}: saved results reference it", id)
        }
        Err(e) => Err(e),
    }
}

/**
 * \brief 按名称或类型模糊搜索模型。
 */
pub fn search_models(conn: &Connection, query: &str) -> Result<Vec<ModelConfig>> {
    let pattern = format!("%{}%", query);
    query_models(
        conn,
        "WHERE name LIKE ?1 OR model_type LIKE ?1 ORDER BY name",
        &[&pattern],
    )
}

/**
 * \brief 排序列出模型；字段限 name/model_type/created_at/is_active。
 */
pub fn sort_models(conn: &Connection, field: &str, order: &str) -> Result<Vec<ModelConfig>> {
    let clause = order_clause(
        field,
        &["name", "model_type", "created_at", "is_active"],
        "name",
        order,
        "ASC",
    );
    query_models(conn, &format!("ORDER BY {}", clause), &[])
}

// ---------------------------------------------------------------------------
// results
// ---------------------------------------------------------------------------

fn map_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredResult> {
    let metadata: Option<String> = row.get(5)?;
    Ok(StoredResult {
        id: row.get(0)?,
        prompt_id: row.get(1)?,
        model_id: row.get(2)?,
        response: row.get(3)?,
        saved_at: row.get(4)?,
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        prompt: row.get(6)?,
        model_name: row.get(7)?,
    })
}

fn query_results(conn: &Connection, sql_tail: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<StoredResult>> {
    let mut stmt = conn.prepare(&format!("{} {}", RESULT_SELECT, sql_tail))?;
    let rows = stmt
        .query_map(args, map_result)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 保存一条模型回复；元数据为空时存 NULL。
 */
pub fn save_result(
    conn: &Connection,
    prompt_id: i64,
    model_id: i64,
    response: &str,
    metadata: Option<&Value>,
) -> Result<i64> {
    let saved_at = now_timestamp()?;
    let metadata_json = match metadata {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(v) => Some(serde_json::to_string(v)?),
    };
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO results (prompt_id, model_id, response, saved_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![prompt_id, model_id, response, saved_at, metadata_json],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 顺序保存一轮分发中成功的结果，跳过失败项，返回新行 ID。
 */
pub fn save_outcomes(conn: &Connection, prompt_id: i64, outcomes: &[DispatchOutcome]) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for outcome in outcomes {
        let Some(reply) = outcome.reply() else {
            continue;
        };
        let metadata = serde_json::to_value(&reply.metadata)?;
        ids.push(save_result(
            conn,
            prompt_id,
            outcome.model_id,
            &reply.response,
            Some(&metadata),
        )?);
    }
    Ok(ids)
}

/**
 * \brief 按保存时间倒序列出结果。
 */
pub fn list_results(conn: &Connection, limit: Option<i64>, offset: i64) -> Result<Vec<StoredResult>> {
    query_results(
        conn,
        "ORDER BY r.saved_at DESC, r.id DESC LIMIT ?1 OFFSET ?2",
        &[&limit.unwrap_or(-1), &offset],
    )
}

pub fn results_for_prompt(conn: &Connection, prompt_id: i64) -> Result<Vec<StoredResult>> {
    query_results(
        conn,
        "WHERE r.prompt_id = ?1 ORDER BY r.saved_at DESC, r.id DESC",
        &[&prompt_id],
    )
}

pub fn results_for_model(conn: &Connection, model_id: i64) -> Result<Vec<StoredResult>> {
    query_results(
        conn,
        "WHERE r.model_id = ?1 ORDER BY r.saved_at DESC, r.id DESC",
        &[&model_id],
    )
}

/**
 * \brief 按回复或提示词正文模糊搜索。
 */
pub fn search_results(conn: &Connection, query: &str, limit: Option<i64>) -> Result<Vec<StoredResult>> {
    let pattern = format!("%{}%", query);
    query_results(
        conn,
        "WHERE r.response LIKE ?1 OR p.prompt LIKE ?1 ORDER BY r.saved_at DESC, r.id DESC LIMIT ?2",
        &[&pattern, &limit.unwrap_or(-1)],
    )
}

/**
 * \brief 排序列出结果；字段限 saved_at/response。
 */
pub fn sort_results(conn: &Connection, field: &str, order: &str) -> Result<Vec<StoredResult>> {
    let clause = order_clause(field, &["saved_at", "response"], "saved_at", order, "DESC");
    query_results(conn, &format!("ORDER BY r.{}", clause), &[])
}

pub fn delete_result(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM results WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

// ---------------------------------------------------------------------------
// settings
// ---------------------------------------------------------------------------

/**
 * \brief 写入设置项（存在则覆盖）。
 */
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let updated_at = now_timestamp()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![key, value, updated_at],
        )
    })?;
    Ok(())
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn all_settings(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn delete_setting(conn: &Connection, key: &str) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM settings WHERE key=?1", params![key]))?;
    Ok(rows > 0)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_setting(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_setting(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, SETTING_TELEMETRY, false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, SETTING_TELEMETRY, enabled)
}

/**
 * \brief 读取请求超时设置（秒），未设置或非法时返回 None。
 */
pub fn get_request_timeout_secs(conn: &Connection) -> Result<Option<u64>> {
    Ok(get_setting(conn, SETTING_TIMEOUT)?
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0))
}

pub fn set_request_timeout_secs(conn: &Connection, secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(ValidationError("timeout must be positive".into()).into());
    }
    set_setting(conn, SETTING_TIMEOUT, &secs.to_string())
}

/**
 * \brief 读取改写流程默认使用的模型 ID。
 */
pub fn get_improver_model_id(conn: &Connection) -> Result<Option<i64>> {
    Ok(get_setting(conn, SETTING_IMPROVER_MODEL)?.and_then(|s| s.parse::<i64>().ok()))
}

pub fn set_improver_model_id(conn: &Connection, id: i64) -> Result<()> {
    if get_model(conn, id)?.is_none() {
        bail!("model id {} not found", id);
    }
    set_setting(conn, SETTING_IMPROVER_MODEL, &id.to_string())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
