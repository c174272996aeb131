use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: "tcp".to_string(),
        }
    }
}

/// A tracked source-to-workload binding that can be redeployed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub source_repository: String,
    pub source_branch: String,
    pub build_file_path: Option<String>,
    pub environment: HashMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
    pub auto_deploy: bool,
    pub created_at: DateTime<Utc>,
    pub last_deployed_at: DateTime<Utc>,
    pub last_revision: Option<String>,
    /// Container currently owned by this deployment. `None` while nothing runs,
    /// e.g. after a failed redeploy.
    pub workload_id: Option<String>,
}

/// What to build and run for a fresh deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub name: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "default_auto_deploy")]
    pub auto_deploy: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_auto_deploy() -> bool {
    true
}

impl From<&Deployment> for DeploymentSpec {
    fn from(deployment: &Deployment) -> Self {
        Self {
            repository: deployment.source_repository.clone(),
            branch: deployment.source_branch.clone(),
            name: deployment.name.clone(),
            environment: deployment.environment.clone(),
            auto_deploy: deployment.auto_deploy,
        }
    }
}

/// Outcome of a successful build-and-run pass, written back onto a `Deployment`.
#[derive(Clone, Debug, PartialEq)]
pub struct Launch {
    pub workload_id: String,
    pub port_mappings: Vec<PortMapping>,
    pub build_file_path: String,
    pub revision: String,
}

/// A container as reported by the container engine. Never mutated by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortMapping>,
    pub environment: HashMap<String, String>,
}

impl Workload {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Push event parsed from an authenticated GitHub webhook payload.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundWebhookEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: WebhookRepository,
    #[serde(default)]
    pub commits: Vec<CommitSummary>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookRepository {
    #[serde(default)]
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommitSummary {
    pub id: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: Option<DateTime<chrono::FixedOffset>>,
}

impl CommitSummary {
    /// Short id, first message line and commit time, e.g. `abc1234 Fix login (2024-05-01T10:00:00+02:00)`.
    pub fn summary(&self) -> String {
        let short_id: String = self.id.chars().take(7).collect();
        let title = self.message.lines().next().unwrap_or_default();
        match self.timestamp {
            Some(timestamp) => format!("{} {} ({})", short_id, title, timestamp.to_rfc3339()),
            None => format!("{} {}", short_id, title),
        }
    }
}

/// Deployment name lower-cased with spaces turned into hyphens.
pub fn slug(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

pub fn image_tag(prefix: &str, name: &str) -> String {
    format!("{}-{}:latest", prefix, slug(name))
}
