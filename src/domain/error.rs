//! Error kinds surfaced by the orchestration core.

use thiserror::Error;

/// Failure reported by the container engine for commands whose outcome drives
/// control flow in the core.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("host port {0} is already bound")]
    PortConflict(u16),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("webhook signature verification failed")]
    AuthenticationFailed,

    #[error("webhook payload could not be parsed: {0}")]
    ParseFailed(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    #[error("no build descriptor found in {repository}")]
    BuildDescriptorNotFound { repository: String },

    #[error("failed to fetch {repository}: {source:#}")]
    SourceFetchFailed {
        repository: String,
        source: anyhow::Error,
    },

    #[error("failed to build image {image}: {source:#}")]
    ImageBuildFailed { image: String, source: anyhow::Error },

    #[error("no free host port for {name}: {reason}")]
    PortAllocationFailed { name: String, reason: String },

    #[error("failed to create workload for {name}: {source:#}")]
    WorkloadCreateFailed { name: String, source: anyhow::Error },

    #[error("failed to start workload {workload_id}: {source:#}")]
    WorkloadStartFailed {
        workload_id: String,
        source: anyhow::Error,
    },

    #[error("failed to {operation} workload {workload_id}: {source:#}")]
    WorkloadOperationFailed {
        operation: &'static str,
        workload_id: String,
        source: anyhow::Error,
    },

    #[error("{step} for {repository} timed out")]
    Timeout {
        step: &'static str,
        repository: String,
    },
}

pub type DeployResult<T> = Result<T, DeployError>;

impl EngineError {
    /// Flattens into an `anyhow::Error` for inclusion in a `DeployError`.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            EngineError::Other(e) => e,
            other => anyhow::Error::new(other),
        }
    }
}
