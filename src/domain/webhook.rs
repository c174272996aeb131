//! Turns authenticated GitHub push deliveries into redeploys.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{
    error::{DeployError, DeployResult},
    model::InboundWebhookEvent,
    signature, DeploymentService,
};

/// Per-deployment result of a webhook-triggered redeploy.
#[derive(Clone, Debug, Serialize)]
pub struct RedeployOutcome {
    pub deployment_id: String,
    pub workload_id: Option<String>,
    pub error: Option<String>,
}

impl RedeployOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// An accepted delivery. `outcomes` resolves once every triggered redeploy has finished.
pub struct WebhookReceipt {
    pub reason: String,
    pub deployments: Vec<String>,
    pub outcomes: Option<JoinHandle<Vec<RedeployOutcome>>>,
}

impl WebhookReceipt {
    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            deployments: Vec::new(),
            outcomes: None,
        }
    }
}

/// Authenticates and parses a delivery, then queues a redeploy for every matching
/// auto-deploy deployment.
///
/// Returns once the redeploys are queued; they run on a spawned task so a slow
/// rebuild never holds up the next delivery. Only authentication and parsing
/// failures are errors: redeploy failures are logged and reported per deployment.
pub async fn handle_webhook(
    service: &Arc<DeploymentService>,
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> DeployResult<WebhookReceipt> {
    if !signature::verify(payload, signature_header.unwrap_or_default(), secret) {
        warn!("Rejected webhook delivery with invalid or missing signature");
        return Err(DeployError::AuthenticationFailed);
    }

    let event: InboundWebhookEvent = serde_json::from_slice(payload).map_err(|e| {
        warn!("Failed to parse webhook payload: {}", e);
        DeployError::ParseFailed(e.to_string())
    })?;
    info!(
        "Webhook push to {} on {} with {} commit(s)",
        event.repository.full_name,
        event.git_ref,
        event.commits.len()
    );
    if let Some(head) = event.commits.last() {
        info!("Head commit {}", head.summary());
    }

    if !is_default_branch_push(&event) {
        info!("Ignoring push to {}: not the default branch", event.git_ref);
        return Ok(WebhookReceipt::ignored(format!(
            "{} is not the default branch",
            event.git_ref
        )));
    }

    let repository = event.repository.clone_url;
    let deployments: Vec<String> = service
        .registry
        .find_by_repository(&repository)
        .await
        .into_iter()
        .map(|deployment| deployment.id)
        .collect();
    if deployments.is_empty() {
        info!("No auto-deploy deployments found for {}", repository);
        return Ok(WebhookReceipt::ignored(format!(
            "no auto-deploy deployments for {}",
            repository
        )));
    }

    info!(
        "Auto-redeploying {} deployment(s) after push to {}",
        deployments.len(),
        repository
    );
    let outcomes = tokio::spawn(redeploy_all(
        service.clone(),
        repository.clone(),
        deployments.clone(),
    ));
    Ok(WebhookReceipt {
        reason: format!("redeploying {} deployment(s)", deployments.len()),
        deployments,
        outcomes: Some(outcomes),
    })
}

/// Redeploys each deployment independently; one failure never stops the others.
pub async fn redeploy_all(
    service: Arc<DeploymentService>,
    repository: String,
    deployment_ids: Vec<String>,
) -> Vec<RedeployOutcome> {
    futures::future::join_all(deployment_ids.into_iter().map(|deployment_id| {
        let service = service.clone();
        let repository = repository.clone();
        async move {
            match service.redeploy(&deployment_id).await {
                Ok(deployment) => RedeployOutcome {
                    deployment_id,
                    workload_id: deployment.workload_id,
                    error: None,
                },
                Err(e) => {
                    error!(
                        "Auto-redeploy of {} after push to {} failed: {}",
                        deployment_id, repository, e
                    );
                    RedeployOutcome {
                        deployment_id,
                        workload_id: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        }
    }))
    .await
}

/// Whether the event targets the repository's declared default branch, falling back
/// to `main`/`master` when the payload does not declare one.
pub fn is_default_branch_push(event: &InboundWebhookEvent) -> bool {
    match event.repository.default_branch.as_deref() {
        Some(branch) if !branch.is_empty() => event.git_ref == format!("refs/heads/{}", branch),
        _ => event.git_ref == "refs/heads/main" || event.git_ref == "refs/heads/master",
    }
}
