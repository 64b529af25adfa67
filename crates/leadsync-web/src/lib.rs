//! Axum JSON front door for the run orchestrator.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadsync_core::AuthToken;
use leadsync_sync::{LeadsyncConfig, RunError, RunOrchestrator, StartRunRequest};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-web";

pub struct AppState {
    orchestrator: RunOrchestrator,
    /// Serializes starts and steps issued through this process.
    step_guard: Mutex<()>,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self {
            orchestrator,
            step_guard: Mutex::new(()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    #[serde(flatten)]
    request: StartRunRequest,
    #[serde(default)]
    auth_token: Option<AuthToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepBody {
    run_id: Uuid,
    #[serde(default)]
    auth_token: Option<AuthToken>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/run/start", post(start_handler))
        .route("/api/run/step", post(step_handler))
        .route("/api/run/cancel", post(cancel_handler))
        .route("/api/run/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = LeadsyncConfig::from_env();
    let state = AppState::new(config.orchestrator()?);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, state_path = %config.state_path.display(), "serving run api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn start_handler(State(state): State<Arc<AppState>>, Json(body): Json<StartBody>) -> Response {
    let _guard = state.step_guard.lock().await;
    respond(
        state
            .orchestrator
            .start_run(&body.request, body.auth_token.as_ref())
            .await,
    )
}

async fn step_handler(State(state): State<Arc<AppState>>, Json(body): Json<StepBody>) -> Response {
    let _guard = state.step_guard.lock().await;
    respond(
        state
            .orchestrator
            .step_run(body.run_id, body.auth_token.as_ref())
            .await,
    )
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.orchestrator.cancel_run().await)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.orchestrator.run_status().await)
}

fn respond<T: Serialize>(result: Result<T, RunError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &RunError) -> Response {
    let status = match err {
        RunError::NotAuthorized { .. } => StatusCode::UNAUTHORIZED,
        RunError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
        RunError::NoActiveRun => StatusCode::NOT_FOUND,
        RunError::RunInProgress { .. } => StatusCode::CONFLICT,
        RunError::MissingLeadsHeaders { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RunError::TableService(_) | RunError::JobProvider(_) => StatusCode::BAD_GATEWAY,
        RunError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(kind = err.kind(), error = %err, "run request failed");
    }
    (status, Json(err.to_body())).into_response()
}
