use std::{convert::Infallible, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use async_stream::stream;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, get_service, post, put},
    Json, Router,
};
use futures_util::{pin_mut, Stream, StreamExt};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::{
    db,
    dispatch::{Dispatcher, OutcomeView},
    export::{self, ExportDocument, ExportEntry, ExportFormat},
    error::ImproveError,
    improver::{Adaptations, Improvement, PromptImprover},
    models::{ModelConfig, ModelPatch, NewModel, ValidationError},
    telemetry,
};

type ApiError = (StatusCode, String);

/**
 * \brief 请求处理共享状态。数据库按请求打开，分发器在请求间共享。
 */
#[derive(Clone, Debug)]
pub struct AppState {
    dispatcher: Dispatcher,
    improver: PromptImprover,
    db_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, db_path: impl Into<PathBuf>) -> Self {
        Self {
            improver: PromptImprover::new(dispatcher.clone()),
            dispatcher,
            db_path: Arc::new(db_path.into()),
        }
    }

    fn open(&self) -> Result<Connection, ApiError> {
        db::open_db(&self.db_path).map_err(internal_err)
    }
}

/**
 * \brief 构建路由：JSON API + 静态页面兜底。
 */
pub fn router(state: AppState, ui_dir: PathBuf) -> Router {
    let static_service = get_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));

    Router::new()
        .route("/api/models", get(list_models).post(create_model))
        .route("/api/models/{id}", put(update_model).delete(remove_model))
        .route("/api/models/{id}/toggle", post(toggle_model))
        .route("/api/prompts", get(list_prompts).post(create_prompt))
        .route("/api/prompts/{id}", delete(remove_prompt))
        .route("/api/dispatch", post(dispatch_round))
        .route("/api/dispatch/sse", get(dispatch_sse))
        .route("/api/results", get(list_results).post(save_result))
        .route("/api/results/{id}", delete(remove_result))
        .route("/api/improve", post(improve_prompt))
        .route("/api/adaptations", post(adapt_prompt))
        .route("/api/export", post(export_round))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState, ui_dir: PathBuf) -> Result<()> {
    {
        let conn = db::open_db(&state.db_path)?;
        db::migrate(&conn)?;
    }
    let app = router(state, ui_dir);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server", &format!("listening addr={}", addr));
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/**
 * \brief 校验类错误映射为 400，其余为 500。
 */
fn api_err(e: anyhow::Error) -> ApiError {
    if e.downcast_ref::<ValidationError>().is_some() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        internal_err(e)
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

/**
 * \brief 按 ID 选取模型；未指定时取全部启用模型。
 */
fn select_models(conn: &Connection, ids: Option<&[i64]>) -> Result<Vec<ModelConfig>> {
    match ids {
        None | Some([]) => db::list_active_models(conn),
        Some(ids) => ids
            .iter()
            .map(|id| -> Result<ModelConfig> {
                db::get_model(conn, *id)?
                    .ok_or_else(|| ValidationError(format!("model id {} not found", id)).into())
            })
            .collect(),
    }
}

/**
 * \brief 一轮分发的目标模型；选不出任何模型时返回 400。
 */
fn round_models(conn: &Connection, ids: Option<&[i64]>) -> Result<Vec<ModelConfig>, ApiError> {
    let configs = select_models(conn, ids).map_err(api_err)?;
    if configs.is_empty() {
        return Err(bad_request("no models selected and no active models configured"));
    }
    Ok(configs)
}

/**
 * \brief 改写流程的模型：显式 ID 优先，否则读取 improver_model_id 设置。
 */
fn improver_model(conn: &Connection, model_id: Option<i64>) -> Result<ModelConfig> {
    let id = match model_id {
        Some(id) => id,
        None => db::get_improver_model_id(conn)?.ok_or_else(|| {
            ValidationError("no model given and improver_model_id is not set".into())
        })?,
    };
    db::get_model(conn, id)?
        .ok_or_else(|| ValidationError(format!("model id {} not found", id)).into())
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| bad_request(format!("invalid model id: {}", s)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// models
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Default)]
struct ModelListQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    order: Option<String>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelListQuery>,
) -> Result<Json<Vec<ModelConfig>>, ApiError> {
    let conn = state.open()?;
    let models = if let Some(query) = q.q.as_deref().filter(|s| !s.trim().is_empty()) {
        db::search_models(&conn, query)
    } else if q.active.unwrap_or(false) {
        db::list_active_models(&conn)
    } else if let Some(field) = q.sort.as_deref() {
        db::sort_models(&conn, field, q.order.as_deref().unwrap_or("ASC"))
    } else {
        db::list_models(&conn)
    }
    .map_err(api_err)?;
    Ok(Json(models))
}

async fn create_model(
    State(state): State<AppState>,
    Json(input): Json<NewModel>,
) -> Result<Json<ModelConfig>, ApiError> {
    let conn = state.open()?;
    let id = db::add_model(&conn, &input).map_err(api_err)?;
    telemetry::log_event(
        "server.model",
        &format!("create id={} name={} type={}", id, input.name, input.model_type),
    );
    let model = db::get_model(&conn, id)
        .map_err(api_err)?
        .ok_or_else(|| internal_err(anyhow!("model id {} vanished after insert", id)))?;
    Ok(Json(model))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<ModelPatch>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let updated = db::update_model(&conn, id, &patch).map_err(api_err)?;
    telemetry::log_event("server.model", &format!("update id={} changed={}", id, updated));
    Ok(Json(json!({ "id": id, "updated": updated })))
}

async fn remove_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    db::delete_model(&conn, id).map_err(api_err)?;
    telemetry::log_event("server.model", &format!("delete id={}", id));
    Ok(Json(json!({ "id": id, "deleted": true })))
}

async fn toggle_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let is_active = db::toggle_model(&conn, id).map_err(api_err)?;
    Ok(Json(json!({ "id": id, "is_active": is_active })))
}

// ---------------------------------------------------------------------------
// prompts
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Default)]
struct PageQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct PromptInput {
    prompt: String,
    #[serde(default)]
    tags: Option<String>,
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let prompts = match q.q.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(query) => db::search_prompts(&conn, query, q.limit),
        None => db::list_prompts(&conn, q.limit, q.offset.unwrap_or(0)),
    }
    .map_err(api_err)?;
    Ok(Json(json!({ "prompts": prompts })))
}

async fn create_prompt(
    State(state): State<AppState>,
    Json(input): Json<PromptInput>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let id = db::add_prompt(&conn, &input.prompt, input.tags.as_deref()).map_err(api_err)?;
    Ok(Json(json!({ "id": id })))
}

async fn remove_prompt(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let deleted = db::delete_prompt(&conn, id).map_err(api_err)?;
    telemetry::log_event("server.prompt", &format!("delete id={} found={}", id, deleted));
    Ok(Json(json!({ "id": id, "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// dispatch
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct DispatchRequest {
    prompt: String,
    /** \brief 目标模型；为空时使用全部启用模型 */
    #[serde(default)]
    model_ids: Option<Vec<i64>>,
    /** \brief 是否保存提示词及成功结果 */
    #[serde(default)]
    save: bool,
    #[serde(default)]
    tags: Option<String>,
}

async fn dispatch_round(
    State(state): State<AppState>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let configs = {
        let conn = state.open()?;
        round_models(&conn, req.model_ids.as_deref())?
    };
    telemetry::log_event(
        "server.dispatch",
        &format!("round models={} save={}", configs.len(), req.save),
    );

    let outcomes = state.dispatcher.dispatch(&req.prompt, &configs).await;

    let (prompt_id, saved_ids) = if req.save {
        let conn = state.open()?;
        let prompt_id = db::add_prompt(&conn, &req.prompt, req.tags.as_deref()).map_err(api_err)?;
        let ids = db::save_outcomes(&conn, prompt_id, &outcomes).map_err(api_err)?;
        (Some(prompt_id), ids)
    } else {
        (None, Vec::new())
    };

    let views: Vec<OutcomeView> = outcomes.iter().map(|o| o.view()).collect();
    Ok(Json(json!({
        "prompt_id": prompt_id,
        "saved_ids": saved_ids,
        "outcomes": views,
    })))
}

#[derive(Deserialize, Debug)]
struct DispatchSseQuery {
    prompt: String,
    /** \brief 逗号分隔的模型 ID */
    #[serde(default)]
    models: Option<String>,
}

/**
 * \brief 流式分发：GET /api/dispatch/sse?prompt=...&models=1,2
 * \details 每个模型完成时推送一个 `outcome` 事件，全部结束后推送 `done`。
 *          客户端断开会丢弃流并中止未完成的请求。
 */
async fn dispatch_sse(
    State(state): State<AppState>,
    Query(q): Query<DispatchSseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if q.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let ids = match q.models.as_deref() {
        Some(raw) => Some(parse_id_list(raw)?),
        None => None,
    };
    let configs = {
        let conn = state.open()?;
        round_models(&conn, ids.as_deref())?
    };
    telemetry::log_event(
        "server.dispatch",
        &format!("sse round models={} prompt_len={}", configs.len(), q.prompt.len()),
    );

    let outcomes = state.dispatcher.dispatch_stream(&q.prompt, &configs);
    let total = configs.len();
    let events = stream! {
        pin_mut!(outcomes);
        while let Some((index, outcome)) = outcomes.next().await {
            let payload = json!({ "index": index, "outcome": outcome.view() });
            yield Ok::<Event, Infallible>(Event::default().event("outcome").data(payload.to_string()));
        }
        yield Ok(Event::default().event("done").data(json!({ "count": total }).to_string()));
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::new()))
}

// ---------------------------------------------------------------------------
// results
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Default)]
struct ResultQuery {
    #[serde(default)]
    prompt_id: Option<i64>,
    #[serde(default)]
    model_id: Option<i64>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct SaveResultInput {
    prompt_id: i64,
    model_id: i64,
    response: String,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn list_results(
    State(state): State<AppState>,
    Query(q): Query<ResultQuery>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let results = if let Some(prompt_id) = q.prompt_id {
        db::results_for_prompt(&conn, prompt_id)
    } else if let Some(model_id) = q.model_id {
        db::results_for_model(&conn, model_id)
    } else if let Some(query) = q.q.as_deref().filter(|s| !s.trim().is_empty()) {
        db::search_results(&conn, query, q.limit)
    } else {
        db::list_results(&conn, q.limit, q.offset.unwrap_or(0))
    }
    .map_err(api_err)?;
    Ok(Json(json!({ "results": results })))
}

async fn save_result(
    State(state): State<AppState>,
    Json(input): Json<SaveResultInput>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let id = db::save_result(
        &conn,
        input.prompt_id,
        input.model_id,
        &input.response,
        input.metadata.as_ref(),
    )
    .map_err(api_err)?;
    Ok(Json(json!({ "id": id })))
}

async fn remove_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let deleted = db::delete_result(&conn, id).map_err(api_err)?;
    Ok(Json(json!({ "id": id, "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// improvement
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct ImproveRequest {
    prompt: String,
    #[serde(default)]
    model_id: Option<i64>,
}

async fn improve_prompt(
    State(state): State<AppState>,
    Json(req): Json<ImproveRequest>,
) -> Result<Json<Improvement>, ApiError> {
    let model = {
        let conn = state.open()?;
        improver_model(&conn, req.model_id).map_err(api_err)?
    };
    let improvement = state
        .improver
        .improve(&req.prompt, &model)
        .await
        .map_err(|e| match e {
            err @ ImproveError::EmptyPrompt => bad_request(err.to_string()),
            err => internal_err(err),
        })?;
    Ok(Json(improvement))
}

async fn adapt_prompt(
    State(state): State<AppState>,
    Json(req): Json<ImproveRequest>,
) -> Result<Json<Adaptations>, ApiError> {
    let model = {
        let conn = state.open()?;
        improver_model(&conn, req.model_id).map_err(api_err)?
    };
    let adaptations = state
        .improver
        .adaptations(&req.prompt, &model)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(adaptations))
}

// ---------------------------------------------------------------------------
// export / health
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct ExportRequest {
    #[serde(default = "default_export_format")]
    format: String,
    /** \brief 导出已保存的某条提示词及其结果 */
    #[serde(default)]
    prompt_id: Option<i64>,
    /** \brief 或直接导出调用方给出的一轮结果 */
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    results: Option<Vec<ExportEntry>>,
}

fn default_export_format() -> String {
    "markdown".to_string()
}

async fn export_round(
    State(state): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<Value>, ApiError> {
    let format: ExportFormat = req.format.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let doc = match (req.prompt_id, req.results) {
        (Some(prompt_id), _) => {
            let conn = state.open()?;
            let prompt = db::get_prompt(&conn, prompt_id)
                .map_err(api_err)?
                .ok_or_else(|| bad_request(format!("prompt id {} not found", prompt_id)))?;
            let results = db::results_for_prompt(&conn, prompt_id).map_err(api_err)?;
            ExportDocument {
                prompt: prompt.prompt,
                results: results.iter().map(ExportEntry::from_stored).collect(),
            }
        }
        (None, Some(results)) => ExportDocument {
            prompt: req.prompt.unwrap_or_default(),
            results,
        },
        (None, None) => return Err(bad_request("either prompt_id or results is required")),
    };
    if doc.results.is_empty() {
        return Err(bad_request("nothing to export"));
    }
    let content = export::render(&doc, format).map_err(internal_err)?;
    Ok(Json(json!({
        "format": format.extension(),
        "content": content,
    })))
}

/**
 * \brief 健康检查：数据库可用性与模型数量。
 */
async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let conn = state.open()?;
    let models = db::list_models(&conn).map_err(api_err)?;
    let active = models.iter().filter(|m| m.is_active).count();
    let missing: Vec<&str> = models
        .iter()
        .filter(|m| m.is_active && !state.dispatcher.credentials().contains(&m.api_id))
        .map(|m| m.name.as_str())
        .collect();
    Ok(Json(json!({
        "ok": true,
        "models": models.len(),
        "active": active,
        "missing_credentials": missing,
        "timeout_secs": state.dispatcher.timeout().as_secs(),
    })))
}
