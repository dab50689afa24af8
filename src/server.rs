//! HTTP and WebSocket transport for the control API.
//!
//! The transport is a thin shell: tenant identity comes from the `X-User-ID`
//! header, requests are handed to the engine handle, and engine errors map
//! onto status codes. The WebSocket endpoint bridges a tenant's event stream
//! onto the socket and answers client pings.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::ApiError;
use crate::model::{Job, JobStatus, WorkflowSubmission};

/// Server handle: bound address plus a shutdown trigger.
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl ApiServer {
    /// Bind and start serving. The listener is bound before returning, so
    /// `addr()` is immediately connectable.
    pub async fn start(bind_addr: SocketAddr, engine: Engine) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind API listener on {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let state = ApiState {
            engine: Arc::new(engine),
        };
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let app = build_router(state);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!(addr = %addr, "api server started");
        Ok(Self { addr, shutdown_tx })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Clone)]
struct ApiState {
    engine: Arc<Engine>,
}

fn build_router(state: ApiState) -> Router {
    use axum::routing::post;

    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/{workflow_id}", get(get_workflow))
        .route("/api/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/api/jobs/{job_id}/results", get(get_job_results))
        .route("/api/progress/workflow/{workflow_id}", get(workflow_progress))
        .route("/api/progress/ws/{tenant_id}", get(subscribe_ws))
        .route("/api/metrics/dashboard", get(dashboard))
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::TenantMissing => StatusCode::UNAUTHORIZED,
            ApiError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::TenantRejected => StatusCode::TOO_MANY_REQUESTS,
            ApiError::DuplicateWorkflowId(_) => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::NotCancellable(_) => StatusCode::CONFLICT,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Extract the tenant id from the `X-User-ID` header.
fn tenant_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("X-User-ID")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::TenantMissing)
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(submission): Json<WorkflowSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let snapshot = state.engine.submit_workflow(&tenant, submission).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn list_workflows(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    Ok(Json(state.engine.list_workflows(&tenant)))
}

async fn get_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    Ok(Json(state.engine.get_workflow(&tenant, &workflow_id)?))
}

async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    Ok(Json(state.engine.get_job(&tenant, &job_id)?))
}

#[derive(Serialize)]
struct JobResultsResponse {
    job_id: String,
    workflow_id: String,
    result_path: String,
}

async fn get_job_results(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let job = state.engine.get_job(&tenant, &job_id)?;
    // Result retrieval itself is the storage service's concern; the API
    // hands back the descriptor once the job has one.
    let result_path = job.result_path.clone().ok_or(ApiError::NotFound)?;
    Ok(Json(JobResultsResponse {
        job_id: job.job_id,
        workflow_id: job.workflow_id,
        result_path,
    }))
}

async fn cancel_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let job: Job = state.engine.cancel_job(&tenant, &job_id).await?;
    Ok(Json(job))
}

#[derive(Serialize)]
struct WorkflowProgressResponse {
    workflow_id: String,
    progress: f64,
    status: crate::model::WorkflowStatus,
    jobs_completed: usize,
    jobs_total: usize,
    active_jobs: Vec<String>,
}

async fn workflow_progress(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(workflow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = tenant_id(&headers)?;
    let snapshot = state.engine.get_workflow(&tenant, &workflow_id)?;
    let active_jobs = snapshot
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Running)
        .map(|j| j.job_id.clone())
        .collect();
    Ok(Json(WorkflowProgressResponse {
        workflow_id: snapshot.workflow_id,
        progress: snapshot.progress,
        status: snapshot.status,
        jobs_completed: snapshot.jobs_completed,
        jobs_total: snapshot.job_count,
        active_jobs,
    }))
}

async fn dashboard(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.dashboard())
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.health())
}

// ============================================================================
// WebSocket subscription
// ============================================================================

async fn subscribe_ws(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| run_subscription(socket, state, tenant_id))
}

/// Pump bus events to the socket and answer pings until either side closes.
async fn run_subscription(mut socket: WebSocket, state: ApiState, tenant_id: String) {
    let mut stream = state.engine.subscribe(&tenant_id);
    debug!(tenant_id, "websocket subscriber attached");

    loop {
        tokio::select! {
            event = stream.recv() => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(?err, "failed to encode progress event");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = answer_client_message(&mut socket, &text).await {
                            debug!(tenant_id, ?err, "websocket send failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(tenant_id, ?err, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    debug!(tenant_id, "websocket subscriber detached");
}

/// Reply `{"type":"pong"}` to an application-level ping; ignore anything
/// else the client sends.
async fn answer_client_message(socket: &mut WebSocket, text: &str) -> Result<()> {
    let parsed: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };
    if parsed.get("type").and_then(|t| t.as_str()) == Some("ping") {
        let pong = json!({ "type": "pong" }).to_string();
        socket
            .send(Message::Text(pong.into()))
            .await
            .context("pong send failed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_header_is_required_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert_eq!(tenant_id(&headers), Err(ApiError::TenantMissing));

        headers.insert("X-User-ID", "  ".parse().unwrap());
        assert_eq!(tenant_id(&headers), Err(ApiError::TenantMissing));

        headers.insert("X-User-ID", " t1 ".parse().unwrap());
        assert_eq!(tenant_id(&headers), Ok("t1".to_string()));
    }
}
