use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Error;
use async_trait::async_trait;

use super::{
    error::EngineError,
    model::{PortMapping, Workload},
};

#[async_trait]
pub trait ContainerEngine {
    async fn list_workloads(&self) -> Result<Vec<Workload>, Error>;

    async fn inspect_workload(&self, id: &str) -> Result<Option<Workload>, Error>;

    /// Builds the image described by `build_file` inside `context` and returns its reference.
    async fn build_image(
        &self,
        context: &Path,
        build_file: &str,
        image_tag: &str,
    ) -> Result<String, Error>;

    async fn create_workload(
        &self,
        image: &str,
        name: &str,
        port_mappings: &[PortMapping],
        environment: &HashMap<String, String>,
    ) -> Result<String, EngineError>;

    async fn start_workload(&self, id: &str) -> Result<(), EngineError>;

    async fn stop_workload(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_workload(&self, id: &str) -> Result<(), EngineError>;

    async fn fetch_logs(&self, id: &str, tail_lines: usize) -> Result<String, Error>;
}

#[async_trait]
pub trait SourceFetcher {
    /// Checks out `branch` of `repository_url` into a fresh local directory.
    async fn fetch_source(&self, repository_url: &str, branch: &str) -> Result<PathBuf, Error>;

    /// Build descriptor inside `checkout`; a root-level match wins over nested ones.
    async fn locate_build_descriptor(&self, checkout: &Path) -> Result<Option<PathBuf>, Error>;

    async fn latest_revision(&self, checkout: &Path) -> Result<String, Error>;

    /// Removes a checkout. Failures are logged, never returned.
    async fn cleanup(&self, checkout: &Path);
}
