use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::error;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::domain::{
    error::DeployError,
    model::{Deployment, DeploymentSpec},
    webhook::handle_webhook,
    DeploymentService,
};

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

pub struct AppState {
    pub service: Arc<DeploymentService>,
    /// `None` keeps the webhook endpoint closed.
    pub webhook_secret: Option<SecretString>,
    pub default_log_tail: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/github", post(github_webhook))
        .route("/deployments", get(list_deployments).post(deploy_from_source))
        .route(
            "/deployments/:id",
            get(get_deployment).delete(remove_deployment),
        )
        .route("/deployments/:id/redeploy", post(redeploy))
        .route("/workloads", get(list_workloads))
        .route("/workloads/:id", get(get_workload).delete(remove_workload))
        .route("/workloads/:id/start", post(start_workload))
        .route("/workloads/:id/stop", post(stop_workload))
        .route("/workloads/:id/logs", get(workload_logs))
        .route("/ports/used", get(used_ports))
        .route("/ports/next", get(next_port))
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn status_of(error: &DeployError) -> StatusCode {
    match error {
        DeployError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        DeployError::ParseFailed(_) => StatusCode::BAD_REQUEST,
        DeployError::DeploymentNotFound(_) | DeployError::WorkloadNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DeployError::BuildDescriptorNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DeployError::PortAllocationFailed { .. } => StatusCode::CONFLICT,
        DeployError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DeployError::SourceFetchFailed { .. }
        | DeployError::ImageBuildFailed { .. }
        | DeployError::WorkloadCreateFailed { .. }
        | DeployError::WorkloadStartFailed { .. }
        | DeployError::WorkloadOperationFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn failure(operation: &str, e: DeployError) -> (StatusCode, Json<ErrorBody>) {
    let status = status_of(&e);
    if status.is_server_error() {
        error!("Error during {} {:#}", operation, e);
    }
    (status, Json(ErrorBody { error: e.to_string() }))
}

#[derive(Serialize)]
struct WebhookReply {
    accepted: bool,
    reason: String,
    deployments: Vec<String>,
}

async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Bytes,
) -> Response {
    let Some(secret) = state.webhook_secret.as_ref() else {
        error!("Webhook delivery refused: no webhook secret configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WebhookReply {
                accepted: false,
                reason: "webhook secret not configured".to_string(),
                deployments: Vec::new(),
            }),
        )
            .into_response();
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match handle_webhook(&state.service, &payload, signature, secret.expose_secret()).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(WebhookReply {
                accepted: true,
                reason: receipt.reason,
                deployments: receipt.deployments,
            }),
        )
            .into_response(),
        Err(e) => (
            status_of(&e),
            Json(WebhookReply {
                accepted: false,
                reason: e.to_string(),
                deployments: Vec::new(),
            }),
        )
            .into_response(),
    }
}

async fn list_deployments(State(state): State<Arc<AppState>>) -> Json<Vec<Deployment>> {
    Json(state.service.list_deployments().await)
}

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .get_deployment(&id)
        .await
        .map(Json)
        .map_err(|e| failure("get_deployment", e))
}

#[derive(Serialize)]
struct DeployReply {
    workload_id: Option<String>,
    deployment: Deployment,
}

async fn deploy_from_source(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<DeploymentSpec>,
) -> impl IntoResponse {
    state
        .service
        .deploy(spec)
        .await
        .map(|deployment| {
            (
                StatusCode::CREATED,
                Json(DeployReply {
                    workload_id: deployment.workload_id.clone(),
                    deployment,
                }),
            )
        })
        .map_err(|e| failure("deploy_from_source", e))
}

async fn redeploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .redeploy(&id)
        .await
        .map(Json)
        .map_err(|e| failure("redeploy", e))
}

async fn remove_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .remove_deployment(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| failure("remove_deployment", e))
}

async fn list_workloads(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .service
        .list_workloads()
        .await
        .map(Json)
        .map_err(|e| failure("list_workloads", e))
}

async fn get_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .get_workload(&id)
        .await
        .map(Json)
        .map_err(|e| failure("get_workload", e))
}

async fn start_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .start_workload(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| failure("start_workload", e))
}

async fn stop_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .stop_workload(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| failure("stop_workload", e))
}

async fn remove_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state
        .service
        .remove_workload(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| failure("remove_workload", e))
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn workload_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    state
        .service
        .workload_logs(&id, query.tail.unwrap_or(state.default_log_tail))
        .await
        .map_err(|e| failure("workload_logs", e))
}

async fn used_ports(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .service
        .used_ports()
        .await
        .map(|ports| {
            let mut ports: Vec<u16> = ports.into_iter().collect();
            ports.sort_unstable();
            Json(ports)
        })
        .map_err(|e| {
            error!("Error during used_ports {:#}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody {
                    error: format!("{:#}", e),
                }),
            )
        })
}

#[derive(Serialize)]
struct NextPort {
    port: u16,
}

async fn next_port(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .service
        .next_available_port()
        .await
        .map(|port| Json(NextPort { port }))
        .map_err(|e| failure("next_port", e))
}
