use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use berth_lifecycle::{BotId, BotStatus};
use berth_runtime::ContainerRuntime;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    lifecycle::{BotLifecycle, LifecycleError},
    reconcile::Reconciler,
    support::format_error_chain,
    watchdog::StartupWatchdog,
};

#[derive(Clone)]
pub struct OpsState {
    pub lifecycle: BotLifecycle,
    pub reconciler: Reconciler,
    pub watchdog: StartupWatchdog,
    pub runtime: Arc<dyn ContainerRuntime>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorBody { message: message.into() })).into_response()
}

fn lifecycle_error(err: LifecycleError) -> Response {
    let code = match &err {
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Draft(_) | LifecycleError::Conflict(_) => StatusCode::CONFLICT,
        LifecycleError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match err {
        LifecycleError::Other(e) => format_error_chain(&e),
        other => other.to_string(),
    };
    json_error(code, message)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    runtime_ok: bool,
    runtime_version: Option<String>,
    runtime_error: Option<String>,
    active_monitors: usize,
}

async fn healthz(State(state): State<OpsState>) -> Json<HealthzResponse> {
    let (runtime_version, runtime_error) = match state.runtime.ping().await {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    };
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        runtime_ok: runtime_error.is_none(),
        runtime_version,
        runtime_error,
        active_monitors: state.watchdog.active_count(),
    })
}

#[derive(Debug, Serialize)]
struct BotStatusResponse {
    bot_id: BotId,
    status: BotStatus,
}

async fn start_bot(State(state): State<OpsState>, Path(id): Path<Uuid>) -> Response {
    match state.lifecycle.start_bot(BotId(id)).await {
        Ok(status) => Json(BotStatusResponse { bot_id: BotId(id), status }).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

async fn stop_bot(State(state): State<OpsState>, Path(id): Path<Uuid>) -> Response {
    match state.lifecycle.stop_bot(BotId(id)).await {
        Ok(status) => Json(BotStatusResponse { bot_id: BotId(id), status }).into_response(),
        Err(e) => lifecycle_error(e),
    }
}

async fn release_bot(State(state): State<OpsState>, Path(id): Path<Uuid>) -> Response {
    match state.lifecycle.release_bot(BotId(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => lifecycle_error(e),
    }
}

async fn reconcile(State(state): State<OpsState>) -> Response {
    match state.reconciler.reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format_error_chain(&e)),
    }
}

async fn cleanup_orphans(State(state): State<OpsState>) -> Response {
    match state.reconciler.cleanup_orphans().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format_error_chain(&e)),
    }
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/bots/:id/start", post(start_bot))
        .route("/bots/:id/stop", post(stop_bot))
        .route("/bots/:id/release", post(release_bot))
        .route("/reconcile", post(reconcile))
        .route("/orphans/cleanup", post(cleanup_orphans))
        .with_state(state)
}
