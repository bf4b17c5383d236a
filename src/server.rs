use std::{convert::Infallible, future::Future, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    broadcast::MonitorEvent,
    monitor::{JobMonitor, MonitorOptions},
    scanner::ScanRequest,
    store::{MemorySessionStore, SessionStore},
    types::{ClientId, JobHandle, ScanMode, SessionId, SessionStatus},
};

#[derive(Clone)]
pub struct AppState {
    monitor: JobMonitor,
    sessions: Arc<MemorySessionStore>,
}

impl AppState {
    /// `sessions` should be the store the monitor persists to.
    pub fn new(monitor: JobMonitor, sessions: Arc<MemorySessionStore>) -> Self {
        Self { monitor, sessions }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartScanBody {
    pub url: String,
    pub scan: ScanRequest,
    #[serde(default)]
    pub distinct: Option<bool>,
    #[serde(default)]
    pub remove_on_done: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StartedScan {
    pub session: SessionId,
    pub mode: ScanMode,
    pub client_id: ClientId,
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub offset: usize,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scans", post(post_scan))
        .route("/scans/{client_id}/{job_id}/events", get(get_events))
        .route("/scans/{client_id}/{job_id}/stop", post(post_stop))
        .route("/scans/{client_id}/{job_id}/results", get(get_results))
        .route("/sessions/{id}", get(get_session))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(
    bind: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "serving scan API");
    serve(listener, state, shutdown).await
}

/// Serve until `shutdown` resolves.
///
/// Monitors are shut down before connections drain: open event streams only
/// end once their job's hub is gone, so graceful shutdown would otherwise
/// wait on them forever.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let monitor = state.monitor.clone();
    let stop = async move {
        shutdown.await;
        monitor.shutdown().await;
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(stop)
        .await?;
    Ok(())
}

fn job_handle(client_id: &str, job_id: String) -> Result<JobHandle, Response> {
    client_id
        .parse::<ClientId>()
        .map(|id| JobHandle::new(id, job_id))
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid client id: {e}")).into_response())
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<StartScanBody>) -> Response {
    match reqwest::Url::parse(&req.url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => {}
        Ok(u) => {
            return (StatusCode::BAD_REQUEST, format!("unsupported scheme: {}", u.scheme()))
                .into_response()
        }
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid url: {e}")).into_response(),
    }

    let mode = req.scan.mode();
    let defaults = MonitorOptions::default();
    let options = MonitorOptions {
        distinct: req.distinct.unwrap_or(defaults.distinct),
        remove_on_done: req.remove_on_done.unwrap_or(defaults.remove_on_done),
    };
    let session = app.sessions.create_session(&req.url, mode).await;

    match app
        .monitor
        .start_and_monitor(session, &req.url, &req.scan, options)
        .await
    {
        Ok(handle) => (
            StatusCode::CREATED,
            Json(StartedScan {
                session,
                mode,
                client_id: handle.client_id,
                job_id: handle.job_id,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(%session, %mode, error = %e, "scan start failed");
            let message = format!("failed to start {mode} scan: {e}");
            if let Err(se) = app
                .sessions
                .update_session_status(session, SessionStatus::failed(message.clone()))
                .await
            {
                warn!(%session, error = %se, "failed to record start failure");
            }
            (StatusCode::BAD_GATEWAY, message).into_response()
        }
    }
}

async fn get_events(
    State(app): State<AppState>,
    Path((client_id, job_id)): Path<(String, String)>,
) -> Response {
    let handle = match job_handle(&client_id, job_id) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    match app.monitor.shared_status_stream(&handle) {
        Some(sub) => Sse::new(sse_events(sub.into_stream()))
            .keep_alive(KeepAlive::default())
            .into_response(),
        None => (StatusCode::NOT_FOUND, "job is not monitored").into_response(),
    }
}

fn sse_events(
    events: impl Stream<Item = MonitorEvent> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    events.map(|event| {
        Ok(match event {
            MonitorEvent::Status(snapshot) => Event::default()
                .event("status")
                .json_data(&snapshot)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
            MonitorEvent::Failed { message } => Event::default().event("error").data(message),
        })
    })
}

async fn post_stop(
    State(app): State<AppState>,
    Path((client_id, job_id)): Path<(String, String)>,
) -> Response {
    let handle = match job_handle(&client_id, job_id) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    if app.monitor.signal_stop(&handle) {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::NOT_FOUND, "job is not monitored").into_response()
    }
}

async fn get_results(
    State(app): State<AppState>,
    Path((client_id, job_id)): Path<(String, String)>,
    Query(q): Query<ResultsQuery>,
) -> Response {
    let handle = match job_handle(&client_id, job_id) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    match app.monitor.partial_results(&handle, q.offset).await {
        Ok(Some(items)) => (StatusCode::OK, Json(items)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "job is not monitored").into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, format!("engine error: {e}")).into_response(),
    }
}

async fn get_session(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match id.parse::<SessionId>() {
        Ok(id) => id,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid session id: {e}")).into_response()
        }
    };
    match app.sessions.session(id).await {
        Some(record) => {
            let results = app.sessions.full_results_for(id).await;
            (
                StatusCode::OK,
                Json(serde_json::json!({ "session": record, "full_results": results })),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
