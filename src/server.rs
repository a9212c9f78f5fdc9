use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    scheduler::{SchedulerError, SchedulerManager, TriggerOutcome},
    store::StoreError,
    types::{CleanupRun, Job, PortResult, ScanQuery, ScanRecord, ScanStats, SweepEvent},
};

#[derive(Clone)]
pub struct AppState {
    manager: Arc<SchedulerManager>, // owns the runner registry and the store handle
}

/// Error body: `{ "error": ..., "code": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Control-surface failures mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        if !e.is_client_error() {
            warn!(error = %e, "request failed");
        }
        match e {
            SchedulerError::Validation(_) => ApiError::BadRequest(e.to_string()),
            SchedulerError::AlreadyActive(_)
            | SchedulerError::AlreadyRunning(_)
            | SchedulerError::NotRunning(_) => ApiError::Conflict(e.to_string()),
            SchedulerError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            SchedulerError::Store(inner) => inner.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", m),
        };
        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub target: String,
    pub start_port: i64,
    pub end_port: i64,
    pub interval_seconds: i64,
    #[serde(default)]
    pub active: bool,
}

/// One-shot scan body: `{ "target": ..., "start_port": ..., "end_port": ... }`.
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    pub start_port: i64,
    pub end_port: i64,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    #[serde(default = "default_cleanup_limit")]
    pub limit: u32,
}

fn default_cleanup_limit() -> u32 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct TargetParam {
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Serialize)]
struct WsMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    data: &'a SweepEvent,
}

/// Build the JSON API, optionally serving a static UI directory as fallback.
pub fn router(manager: Arc<SchedulerManager>, ui_dir: Option<PathBuf>) -> Router {
    let state = AppState { manager };

    let api = Router::new()
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route("/schedules/{id}", get(get_schedule).delete(delete_schedule))
        .route("/schedules/{id}/start", post(start_schedule))
        .route("/schedules/{id}/stop", post(stop_schedule))
        .route("/schedules/{id}/trigger", post(trigger_schedule))
        .route("/scan", post(scan_now))
        .route("/scans", get(list_scans).delete(delete_scans_for_target))
        .route("/scans/{id}", delete(delete_scan))
        .route("/stats", get(get_stats))
        .route("/cleanup", get(list_cleanup_runs))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    match ui_dir {
        Some(dir) => {
            app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        }
        None => app,
    }
}

/// Serve `app` on `bind` until `shutdown` is cancelled.
pub async fn serve(bind: &str, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("serving API on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn port_field(name: &str, value: i64) -> Result<u16, ApiError> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ApiError::BadRequest(format!("{name} must be in 1..=65535, got {value}")))
}

async fn create_schedule(
    State(app): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<CreatedResponse>, ApiError> {
    if req.interval_seconds <= 0 {
        return Err(ApiError::BadRequest(
            "interval_seconds must be positive".into(),
        ));
    }
    let start = port_field("start_port", req.start_port)?;
    let end = port_field("end_port", req.end_port)?;
    let interval = Duration::from_secs(req.interval_seconds as u64);

    let id = app
        .manager
        .create_job(req.target, start, end, interval, req.active)
        .await?;
    Ok(Json(CreatedResponse { id }))
}

async fn list_schedules(State(app): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(app.manager.list_jobs().await?))
}

async fn get_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(app.manager.get_job(id).await?))
}

fn message(msg: &str) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: msg.to_string(),
    })
}

async fn start_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    app.manager.start_job_by_id(id).await?;
    Ok(message("started"))
}

async fn stop_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    app.manager.stop_job(id).await?;
    Ok(message("stopped"))
}

async fn trigger_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let outcome = app.manager.trigger_job(id).await?;
    let status = match outcome {
        TriggerOutcome::Started => StatusCode::ACCEPTED,
        TriggerOutcome::Skipped => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn delete_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    app.manager.delete_job(id).await?;
    Ok(message("deleted"))
}

async fn scan_now(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<Vec<PortResult>>, ApiError> {
    let start = port_field("start_port", req.start_port)?;
    let end = port_field("end_port", req.end_port)?;
    let results = app.manager.scan_now(req.target, start, end).await?;
    Ok(Json(results))
}

async fn list_scans(
    State(app): State<AppState>,
    Query(query): Query<ScanQuery>,
) -> Result<Json<Vec<ScanRecord>>, ApiError> {
    Ok(Json(app.manager.store().list_scans(&query).await?))
}

async fn delete_scans_for_target(
    State(app): State<AppState>,
    Query(param): Query<TargetParam>,
) -> Result<Json<MessageResponse>, ApiError> {
    let target = param
        .target
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("target query parameter required".into()))?;
    let count = app.manager.store().delete_scans_for_target(&target).await?;
    Ok(message(&format!("deleted {count} scans for target {target}")))
}

async fn delete_scan(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MessageResponse>, ApiError> {
    app.manager.store().delete_scan(id).await?;
    Ok(message(&format!("deleted scan {id}")))
}

async fn get_stats(State(app): State<AppState>) -> Result<Json<ScanStats>, ApiError> {
    Ok(Json(app.manager.store().scan_stats().await?))
}

async fn list_cleanup_runs(
    State(app): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<Vec<CleanupRun>>, ApiError> {
    Ok(Json(app.manager.store().list_cleanup_logs(params.limit).await?))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_sweeps(socket, app))
}

/// Push every completed sweep to one websocket client until either side goes away.
async fn relay_sweeps(socket: WebSocket, app: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = app.manager.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "websocket client lagging, dropped sweep events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&WsMessage {
                msg_type: "scan_complete",
                data: &event,
            }) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
