//! HTTP handler implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, ServerError};
use crate::sandbox::{ExecutionOutcome, ExecutionRequest, Executor};

/// Maximum accepted request body.
pub const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

const MISSING_FIELDS: &str = "Missing language or code in request body";

/// Body of `POST /api/run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub language: Option<String>,
    pub code: Option<String>,
    /// Optional timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Response of `POST /api/run`.
///
/// Either `{ "output", "exitCode" }` or `{ "error" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunResponse {
    Success {
        output: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
    Failure {
        error: String,
    },
}

impl RunResponse {
    fn error(message: impl Into<String>) -> Self {
        Self::Failure {
            error: message.into(),
        }
    }
}

/// Builds the service router.
pub fn router(executor: Executor) -> Router {
    Router::new()
        .route("/api/run", post(run_code))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(executor)
}

/// Serves requests on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns error if the server fails while accepting connections.
pub async fn serve<F>(listener: TcpListener, executor: Executor, shutdown: F) -> crate::error::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(executor))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Transport(e.to_string()))?;
    Ok(())
}

/// Run the HTTP server on `addr` until Ctrl-C.
///
/// # Errors
///
/// Returns error if the address cannot be bound or the server fails.
pub async fn run(addr: SocketAddr, executor: Executor) -> crate::error::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

    info!(
        addr = %listener.local_addr().unwrap_or(addr),
        runner = executor.runner_name(),
        "Listening for execution requests"
    );

    serve(listener, executor, shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn run_code(
    State(executor): State<Executor>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> (StatusCode, Json<RunResponse>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected request body");
            return (
                rejection.status(),
                Json(RunResponse::error(format!(
                    "Invalid request body: {}",
                    rejection.body_text()
                ))),
            );
        }
    };

    let mut request = ExecutionRequest::new(
        body.language.unwrap_or_default(),
        body.code.unwrap_or_default(),
    );
    if let Some(ms) = body.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    let timeout = executor.effective_timeout(request.timeout);

    let (status, response) = match executor.execute(request).await {
        Ok(outcome) => respond(outcome, timeout),
        Err(ExecutionError::Validation(_)) => {
            (StatusCode::BAD_REQUEST, RunResponse::error(MISSING_FIELDS))
        }
        Err(e @ ExecutionError::Workspace(_)) => {
            warn!(error = %e, "Workspace unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, RunResponse::error(e.to_string()))
        }
    };

    (status, Json(response))
}

/// Maps an outcome onto the wire contract.
///
/// Any stderr output turns a completed run into an error response,
/// regardless of exit code.
pub fn respond(outcome: ExecutionOutcome, timeout: Duration) -> (StatusCode, RunResponse) {
    match outcome {
        ExecutionOutcome::Completed { stderr, .. } if !stderr.is_empty() => {
            (StatusCode::OK, RunResponse::error(stderr))
        }
        ExecutionOutcome::Completed {
            stdout, exit_code, ..
        } => (
            StatusCode::OK,
            RunResponse::Success {
                output: stdout.trim().to_string(),
                exit_code,
            },
        ),
        ExecutionOutcome::TimedOut => (
            StatusCode::OK,
            RunResponse::error(format!(
                "Execution timed out after {}ms",
                timeout.as_millis()
            )),
        ),
        ExecutionOutcome::RunnerStartFailure { reason } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            RunResponse::error(format!("Failed to start runner: {reason}")),
        ),
        ExecutionOutcome::UnsupportedLanguage { language } => (
            StatusCode::BAD_REQUEST,
            RunResponse::error(format!("Unsupported language: {language}")),
        ),
    }
}
