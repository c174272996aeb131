use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use error::{DeployError, DeployResult, EngineError};
use log::{error, info, warn};
use model::{image_tag, slug, Deployment, DeploymentSpec, Launch, PortMapping, Workload};
use port::{ContainerEngine, SourceFetcher};
use rand::{distributions::Alphanumeric, Rng};
use registry::DeploymentRegistry;
use tokio::time::{timeout_at, Instant};

pub mod allocator;
pub mod error;
pub mod model;
pub mod port;
pub mod registry;
pub mod signature;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

/// Attempts at binding a host port before a lost allocation race becomes fatal.
const BIND_ATTEMPTS: usize = 2;

#[derive(Clone, Debug)]
pub struct DeploySettings {
    pub image_prefix: String,
    pub port_range_start: u16,
    pub container_port: u16,
    /// Deadline shared by source fetch and image build.
    pub operation_timeout: Duration,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            image_prefix: "harbormaster".to_string(),
            port_range_start: 8000,
            container_port: 80,
            operation_timeout: Duration::from_secs(900),
        }
    }
}

pub struct DeploymentService {
    pub container_engine: Arc<dyn ContainerEngine + Send + Sync>,
    pub source_fetcher: Arc<dyn SourceFetcher + Send + Sync>,
    pub registry: DeploymentRegistry,
    pub settings: DeploySettings,
}

impl DeploymentService {
    pub fn new(
        container_engine: Arc<dyn ContainerEngine + Send + Sync>,
        source_fetcher: Arc<dyn SourceFetcher + Send + Sync>,
        settings: DeploySettings,
    ) -> Self {
        Self {
            container_engine,
            source_fetcher,
            registry: DeploymentRegistry::new(),
            settings,
        }
    }

    /// Builds and starts a new deployment from source, then registers it.
    pub async fn deploy(&self, spec: DeploymentSpec) -> DeployResult<Deployment> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "Deploying {} from {} (branch {}) as deployment {}",
            spec.name, spec.repository, spec.branch, id
        );
        let launch = self
            .launch(&id, &spec)
            .await
            .inspect_err(|e| error!("Deployment {} of {} failed: {}", id, spec.repository, e))?;

        let now = Utc::now();
        let deployment = Deployment {
            id,
            name: spec.name,
            source_repository: spec.repository,
            source_branch: spec.branch,
            build_file_path: Some(launch.build_file_path),
            environment: spec.environment,
            port_mappings: launch.port_mappings,
            auto_deploy: spec.auto_deploy,
            created_at: now,
            last_deployed_at: now,
            last_revision: Some(launch.revision),
            workload_id: Some(launch.workload_id),
        };
        self.registry.add(deployment.clone()).await;
        info!(
            "Deployment {} ({}) running as workload {}",
            deployment.id,
            deployment.name,
            deployment.workload_id.as_deref().unwrap_or_default()
        );
        Ok(deployment)
    }

    /// Replaces the workload of an existing deployment with a freshly built one.
    ///
    /// Concurrent calls for the same id run one after the other. Whatever the
    /// outcome, the record never points at a removed workload: it is detached
    /// from the old one before the rebuild starts.
    pub async fn redeploy(&self, deployment_id: &str) -> DeployResult<Deployment> {
        let _guard = self.registry.lock(deployment_id).await;
        let deployment = self.registry.get(deployment_id).await.ok_or_else(|| {
            warn!("Deployment {} not found", deployment_id);
            DeployError::DeploymentNotFound(deployment_id.to_string())
        })?;
        info!(
            "Redeploying {} ({}) from {}",
            deployment.id, deployment.name, deployment.source_repository
        );

        if let Some(workload_id) = deployment.workload_id.as_deref() {
            self.retire_workload(&deployment, workload_id).await;
            self.registry.clear_workload(&deployment.id).await;
        }

        let launch = match self.launch(&deployment.id, &DeploymentSpec::from(&deployment)).await {
            Ok(launch) => launch,
            Err(e) => {
                error!(
                    "Redeploy of {} from {} failed, no workload left running: {}",
                    deployment.id, deployment.source_repository, e
                );
                return Err(e);
            }
        };

        let workload_id = launch.workload_id.clone();
        if !self
            .registry
            .update_after_redeploy(&deployment.id, launch, Utc::now())
            .await
        {
            // Removal takes the same lock, so the record cannot vanish while we hold it
            return Err(DeployError::DeploymentNotFound(deployment.id));
        }
        info!(
            "Redeployed {} ({}) as workload {}",
            deployment.id, deployment.name, workload_id
        );
        self.registry
            .get(&deployment.id)
            .await
            .ok_or(DeployError::DeploymentNotFound(deployment.id))
    }

    /// Stops and removes a deployment's old workload. Failures are only logged:
    /// the workload may already be gone after an earlier partial failure.
    async fn retire_workload(&self, deployment: &Deployment, workload_id: &str) {
        match self.container_engine.stop_workload(workload_id).await {
            Ok(()) => info!("Stopped workload {} of {}", workload_id, deployment.id),
            Err(EngineError::NotFound(_)) => {
                info!("Workload {} of {} already gone", workload_id, deployment.id)
            }
            Err(e) => warn!(
                "step=stop deployment={} repository={} workload={}: {:#}",
                deployment.id,
                deployment.source_repository,
                workload_id,
                e.into_anyhow()
            ),
        }
        match self.container_engine.remove_workload(workload_id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(
                "step=remove deployment={} repository={} workload={}: {:#}",
                deployment.id,
                deployment.source_repository,
                workload_id,
                e.into_anyhow()
            ),
        }
    }

    /// Fetch, build and run `spec`. The checkout is always cleaned up.
    async fn launch(&self, deployment_id: &str, spec: &DeploymentSpec) -> DeployResult<Launch> {
        let deadline = Instant::now() + self.settings.operation_timeout;

        let checkout = timeout_at(
            deadline,
            self.source_fetcher.fetch_source(&spec.repository, &spec.branch),
        )
        .await
        .map_err(|_| DeployError::Timeout {
            step: "fetch",
            repository: spec.repository.clone(),
        })?
        .map_err(|source| DeployError::SourceFetchFailed {
            repository: spec.repository.clone(),
            source,
        })?;

        let result = self
            .build_and_run(deployment_id, spec, &checkout, deadline)
            .await;
        self.source_fetcher.cleanup(&checkout).await;
        result
    }

    async fn build_and_run(
        &self,
        deployment_id: &str,
        spec: &DeploymentSpec,
        checkout: &Path,
        deadline: Instant,
    ) -> DeployResult<Launch> {
        let descriptor = self
            .source_fetcher
            .locate_build_descriptor(checkout)
            .await
            .map_err(|source| DeployError::SourceFetchFailed {
                repository: spec.repository.clone(),
                source,
            })?
            .ok_or_else(|| DeployError::BuildDescriptorNotFound {
                repository: spec.repository.clone(),
            })?;
        let build_file_path = descriptor
            .strip_prefix(checkout)
            .unwrap_or(&descriptor)
            .to_string_lossy()
            .into_owned();
        info!(
            "step=locate deployment={} repository={} descriptor={}",
            deployment_id, spec.repository, build_file_path
        );

        let revision = self
            .source_fetcher
            .latest_revision(checkout)
            .await
            .map_err(|source| DeployError::SourceFetchFailed {
                repository: spec.repository.clone(),
                source,
            })?;

        let image = image_tag(&self.settings.image_prefix, &spec.name);
        let (context, build_file) = build_context(checkout, &descriptor);
        info!(
            "step=build deployment={} repository={} revision={} image={}",
            deployment_id, spec.repository, revision, image
        );
        let image_ref = timeout_at(
            deadline,
            self.container_engine
                .build_image(&context, &build_file, &image),
        )
        .await
        .map_err(|_| DeployError::Timeout {
            step: "build",
            repository: spec.repository.clone(),
        })?
        .map_err(|source| DeployError::ImageBuildFailed {
            image: image.clone(),
            source,
        })?;

        let (workload_id, port_mappings) = self
            .bind_workload(deployment_id, spec, &image_ref)
            .await?;

        Ok(Launch {
            workload_id,
            port_mappings,
            build_file_path,
            revision,
        })
    }

    /// Allocates a host port, then creates and starts the workload on it. A port
    /// lost to a concurrent allocation is retried once with a fresh port.
    async fn bind_workload(
        &self,
        deployment_id: &str,
        spec: &DeploymentSpec,
        image_ref: &str,
    ) -> DeployResult<(String, Vec<PortMapping>)> {
        for attempt in 1..=BIND_ATTEMPTS {
            let port_mappings = vec![PortMapping::tcp(
                self.allocate_port(&spec.name).await?,
                self.settings.container_port,
            )];
            let host_port = port_mappings[0].host_port;
            let name = workload_name(&spec.name);
            info!(
                "step=create deployment={} repository={} workload={} port={}",
                deployment_id, spec.repository, name, host_port
            );

            let workload_id = match self
                .container_engine
                .create_workload(image_ref, &name, &port_mappings, &spec.environment)
                .await
            {
                Ok(workload_id) => workload_id,
                Err(EngineError::PortConflict(port)) => {
                    warn!(
                        "step=create deployment={} repository={}: port {} taken (attempt {}/{})",
                        deployment_id, spec.repository, port, attempt, BIND_ATTEMPTS
                    );
                    continue;
                }
                Err(e) => {
                    return Err(DeployError::WorkloadCreateFailed {
                        name,
                        source: e.into_anyhow(),
                    })
                }
            };

            match self.container_engine.start_workload(&workload_id).await {
                Ok(()) => return Ok((workload_id, port_mappings)),
                Err(EngineError::PortConflict(port)) => {
                    warn!(
                        "step=start deployment={} repository={}: port {} taken (attempt {}/{})",
                        deployment_id, spec.repository, port, attempt, BIND_ATTEMPTS
                    );
                    // Never started, superseded by the next attempt
                    if let Err(e) = self.container_engine.remove_workload(&workload_id).await {
                        warn!(
                            "step=remove deployment={} workload={}: {:#}",
                            deployment_id,
                            workload_id,
                            e.into_anyhow()
                        );
                    }
                }
                Err(e) => {
                    // The created workload is left in place for the operator to inspect
                    return Err(DeployError::WorkloadStartFailed {
                        workload_id,
                        source: e.into_anyhow(),
                    });
                }
            }
        }
        Err(DeployError::PortAllocationFailed {
            name: spec.name.clone(),
            reason: format!("host port still in use after {} attempts", BIND_ATTEMPTS),
        })
    }

    /// Next free host port, computed from the live workload list.
    async fn allocate_port(&self, name: &str) -> DeployResult<u16> {
        let used = self.used_ports().await.map_err(|e| DeployError::PortAllocationFailed {
            name: name.to_string(),
            reason: format!("{:#}", e),
        })?;
        allocator::next_available_port(&used, self.settings.port_range_start).ok_or_else(|| {
            DeployError::PortAllocationFailed {
                name: name.to_string(),
                reason: format!("no free port above {}", self.settings.port_range_start),
            }
        })
    }

    pub async fn used_ports(&self) -> Result<std::collections::HashSet<u16>, anyhow::Error> {
        let workloads = self.container_engine.list_workloads().await?;
        Ok(allocator::used_ports(&workloads))
    }

    pub async fn next_available_port(&self) -> DeployResult<u16> {
        self.allocate_port("preview").await
    }

    pub async fn list_deployments(&self) -> Vec<Deployment> {
        self.registry.list_all().await
    }

    pub async fn get_deployment(&self, id: &str) -> DeployResult<Deployment> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| DeployError::DeploymentNotFound(id.to_string()))
    }

    /// Removes a deployment together with the workload it owns.
    ///
    /// The record is kept if the engine refuses the removal, so the operator can retry.
    pub async fn remove_deployment(&self, id: &str) -> DeployResult<()> {
        let _guard = self.registry.lock(id).await;
        let deployment = self.get_deployment(id).await?;
        if let Some(workload_id) = deployment.workload_id.as_deref() {
            match self.container_engine.remove_workload(workload_id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    let source = e.into_anyhow();
                    error!(
                        "step=remove deployment={} repository={} workload={}: {:#}",
                        id, deployment.source_repository, workload_id, source
                    );
                    return Err(DeployError::WorkloadOperationFailed {
                        operation: "remove",
                        workload_id: workload_id.to_string(),
                        source,
                    });
                }
            }
        }
        self.registry.remove(id).await;
        info!("Removed deployment {} ({})", id, deployment.name);
        Ok(())
    }

    pub async fn list_workloads(&self) -> DeployResult<Vec<Workload>> {
        self.container_engine
            .list_workloads()
            .await
            .map_err(|source| DeployError::WorkloadOperationFailed {
                operation: "list",
                workload_id: String::new(),
                source,
            })
    }

    pub async fn get_workload(&self, id: &str) -> DeployResult<Workload> {
        self.container_engine
            .inspect_workload(id)
            .await
            .map_err(|source| DeployError::WorkloadOperationFailed {
                operation: "inspect",
                workload_id: id.to_string(),
                source,
            })?
            .ok_or_else(|| DeployError::WorkloadNotFound(id.to_string()))
    }

    pub async fn start_workload(&self, id: &str) -> DeployResult<()> {
        let result = self.container_engine.start_workload(id).await;
        operator_result("start", id, result)
    }

    pub async fn stop_workload(&self, id: &str) -> DeployResult<()> {
        let result = self.container_engine.stop_workload(id).await;
        operator_result("stop", id, result)
    }

    /// Removes a workload and forgets the deployment that owned it, if any.
    pub async fn remove_workload(&self, id: &str) -> DeployResult<()> {
        let owner = self.registry.find_by_workload(id).await;
        let _guard = match &owner {
            Some(deployment) => Some(self.registry.lock(&deployment.id).await),
            None => None,
        };
        // Re-read under the lock: a redeploy may have moved the record on meanwhile
        let owner = match owner {
            Some(deployment) => self
                .registry
                .get(&deployment.id)
                .await
                .filter(|current| current.workload_id.as_deref() == Some(id)),
            None => None,
        };

        match self.container_engine.remove_workload(id).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) if owner.is_some() => {
                warn!("Workload {} already gone, dropping its deployment record", id)
            }
            Err(e) => return operator_result("remove", id, Err(e)),
        }
        if let Some(deployment) = owner {
            self.registry.remove(&deployment.id).await;
            info!("Removed deployment {} along with workload {}", deployment.id, id);
        }
        Ok(())
    }

    pub async fn workload_logs(&self, id: &str, tail_lines: usize) -> DeployResult<String> {
        self.container_engine
            .fetch_logs(id, tail_lines)
            .await
            .map_err(|source| DeployError::WorkloadOperationFailed {
                operation: "fetch logs of",
                workload_id: id.to_string(),
                source,
            })
    }
}

fn operator_result(
    operation: &'static str,
    id: &str,
    result: Result<(), EngineError>,
) -> DeployResult<()> {
    match result {
        Ok(()) => {
            info!("Workload {} {} done", id, operation);
            Ok(())
        }
        Err(EngineError::NotFound(_)) => Err(DeployError::WorkloadNotFound(id.to_string())),
        Err(e) => {
            let source = e.into_anyhow();
            error!("step={} workload={}: {:#}", operation, id, source);
            Err(DeployError::WorkloadOperationFailed {
                operation,
                workload_id: id.to_string(),
                source,
            })
        }
    }
}

/// Splits a descriptor path into the directory used as build context and the file name.
fn build_context(checkout: &Path, descriptor: &Path) -> (PathBuf, String) {
    let context = descriptor
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| checkout.to_path_buf());
    let build_file = descriptor
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string());
    (context, build_file)
}

fn workload_name(name: &str) -> String {
    format!(
        "{}.{}",
        slug(name),
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(char::from)
            .collect::<String>()
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::testing::{Failure, FakeEngine, FakeFetcher};
    use super::*;

    fn service(engine: &Arc<FakeEngine>, fetcher: &Arc<FakeFetcher>) -> DeploymentService {
        DeploymentService::new(
            engine.clone(),
            fetcher.clone(),
            DeploySettings {
                operation_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    fn spec(name: &str) -> DeploymentSpec {
        DeploymentSpec {
            repository: "https://example.com/org/app.git".to_string(),
            branch: "main".to_string(),
            name: name.to_string(),
            environment: HashMap::from([("MODE".to_string(), "prod".to_string())]),
            auto_deploy: true,
        }
    }

    #[tokio::test]
    async fn deploy_runs_full_sequence_and_registers() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let deployment = service.deploy(spec("My App")).await.unwrap();

        let workload_id = deployment.workload_id.clone().unwrap();
        assert_eq!(
            engine.calls(),
            vec![
                "build:harbormaster-my-app:latest".to_string(),
                format!("create:{}", workload_id),
                format!("start:{}", workload_id),
            ]
        );
        assert_eq!(deployment.port_mappings, vec![PortMapping::tcp(8000, 80)]);
        assert_eq!(deployment.build_file_path.as_deref(), Some("Dockerfile"));
        assert_eq!(deployment.last_revision.as_deref(), Some("rev-1"));
        assert_eq!(deployment.created_at, deployment.last_deployed_at);
        assert_eq!(service.registry.get(&deployment.id).await, Some(deployment.clone()));

        let workload = engine.workload(&workload_id).unwrap();
        assert!(workload.is_running());
        assert_eq!(workload.environment.get("MODE").map(String::as_str), Some("prod"));
        assert!(workload.name.starts_with("my-app."));
        assert_eq!(fetcher.cleaned().len(), 1);
    }

    #[tokio::test]
    async fn deploy_skips_ports_held_by_other_workloads() {
        let engine = Arc::new(FakeEngine::default());
        engine.insert_running("other", &[8000, 8001]);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let deployment = service.deploy(spec("app")).await.unwrap();
        assert_eq!(deployment.port_mappings[0].host_port, 8002);
    }

    #[tokio::test]
    async fn deploy_without_descriptor_fails_and_cleans_checkout() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new().without_descriptor());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::BuildDescriptorNotFound { .. }));
        assert!(engine.calls().is_empty());
        assert_eq!(fetcher.cleaned().len(), 1);
        assert!(service.list_deployments().await.is_empty());
    }

    #[tokio::test]
    async fn deploy_surfaces_fetch_failure() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new().failing());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::SourceFetchFailed { .. }));
        assert!(fetcher.cleaned().is_empty());
    }

    #[tokio::test]
    async fn deploy_surfaces_build_failure_and_cleans_checkout() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_builds();
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::ImageBuildFailed { .. }));
        assert_eq!(fetcher.cleaned().len(), 1);
    }

    #[tokio::test]
    async fn slow_build_times_out_and_cleans_checkout() {
        let engine = Arc::new(FakeEngine::default());
        engine.delay_builds(Duration::from_secs(5));
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::Timeout { step: "build", .. }));
        assert_eq!(fetcher.cleaned().len(), 1);
        assert!(engine.workloads().is_empty());
    }

    #[tokio::test]
    async fn slow_fetch_times_out_before_build() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new().slow(Duration::from_secs(5)));
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::Timeout { step: "fetch", .. }));
        assert!(fetcher.fetched().is_empty());
        assert!(engine.calls().is_empty());
        assert!(service.list_deployments().await.is_empty());
    }

    #[tokio::test]
    async fn create_port_conflict_is_retried_once() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next_create(Failure::PortConflict);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let deployment = service.deploy(spec("app")).await.unwrap();
        assert!(deployment.workload_id.is_some());
    }

    #[tokio::test]
    async fn start_port_conflict_discards_workload_and_retries() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next_start(Failure::PortConflict);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let deployment = service.deploy(spec("app")).await.unwrap();
        let workloads = engine.workloads();
        assert_eq!(workloads.len(), 1);
        assert_eq!(Some(&workloads[0].id), deployment.workload_id.as_ref());
    }

    #[tokio::test]
    async fn second_port_conflict_is_port_allocation_failure() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next_create(Failure::PortConflict);
        engine.fail_next_create(Failure::PortConflict);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::PortAllocationFailed { .. }));
    }

    #[tokio::test]
    async fn start_failure_leaves_created_workload_for_operator() {
        let engine = Arc::new(FakeEngine::default());
        engine.fail_next_start(Failure::Other);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let err = service.deploy(spec("app")).await.unwrap_err();
        assert!(matches!(err, DeployError::WorkloadStartFailed { .. }));
        assert_eq!(engine.workloads().len(), 1);
        assert!(service.list_deployments().await.is_empty());
        assert_eq!(fetcher.cleaned().len(), 1);
    }

    #[tokio::test]
    async fn redeploy_replaces_workload_each_time() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();
        let first = deployment.workload_id.clone().unwrap();

        let second = service.redeploy(&deployment.id).await.unwrap();
        let second_id = second.workload_id.clone().unwrap();
        assert_ne!(first, second_id);
        assert!(engine.workload(&first).is_none());

        let third = service.redeploy(&deployment.id).await.unwrap();
        let third_id = third.workload_id.clone().unwrap();
        assert_ne!(second_id, third_id);
        assert!(engine.workload(&second_id).is_none());

        let records = service.list_deployments().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].workload_id.as_deref(), Some(third_id.as_str()));
        assert_eq!(records[0].created_at, deployment.created_at);
        assert!(records[0].last_deployed_at >= deployment.last_deployed_at);
        assert_eq!(engine.workloads().len(), 1);
    }

    #[tokio::test]
    async fn redeploy_of_unknown_id_is_not_found() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        let err = service.redeploy("nope").await.unwrap_err();
        assert!(matches!(err, DeployError::DeploymentNotFound(id) if id == "nope"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn create_failure_after_removal_clears_workload() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();
        let old = deployment.workload_id.clone().unwrap();

        engine.fail_next_create(Failure::Other);
        let err = service.redeploy(&deployment.id).await.unwrap_err();
        assert!(matches!(err, DeployError::WorkloadCreateFailed { .. }));

        assert!(engine.workload(&old).is_none());
        let record = service.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(record.workload_id, None);

        // The cleared record recovers on the next redeploy
        let recovered = service.redeploy(&deployment.id).await.unwrap();
        assert!(recovered.workload_id.is_some());
    }

    #[tokio::test]
    async fn redeploy_tolerates_missing_old_workload() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();
        engine.forget(deployment.workload_id.as_deref().unwrap());

        let redeployed = service.redeploy(&deployment.id).await.unwrap();
        assert!(redeployed.workload_id.is_some());
    }

    #[tokio::test]
    async fn redeploy_continues_past_failed_stop_and_remove() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();
        let old = deployment.workload_id.clone().unwrap();
        engine.clear_calls();

        engine.fail_next_stop(Failure::Other);
        engine.fail_next_remove(Failure::Other);
        let redeployed = service.redeploy(&deployment.id).await.unwrap();

        let new = redeployed.workload_id.clone().unwrap();
        assert_ne!(new, old);
        assert_eq!(
            engine.calls(),
            vec![
                format!("stop:{}", old),
                format!("remove:{}", old),
                "build:harbormaster-app:latest".to_string(),
                format!("create:{}", new),
                format!("start:{}", new),
            ]
        );
        assert!(service.registry.find_by_workload(&old).await.is_none());
        // The stuck container still holds its port, so the new one moved on
        assert_eq!(redeployed.port_mappings, vec![PortMapping::tcp(8001, 80)]);
    }

    #[tokio::test]
    async fn not_found_requests_leave_no_lock_entries() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        for i in 0..200 {
            assert!(service.redeploy(&format!("ghost-{}", i)).await.is_err());
            assert!(service.remove_deployment(&format!("gone-{}", i)).await.is_err());
        }
        let deployment = service.deploy(spec("app")).await.unwrap();
        service.redeploy(&deployment.id).await.unwrap();
        service.remove_deployment(&deployment.id).await.unwrap();

        assert_eq!(service.registry.lock_entries(), 0);
    }

    #[tokio::test]
    async fn concurrent_redeploys_of_same_id_do_not_interleave() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = Arc::new(DeploymentService::new(
            engine.clone(),
            fetcher.clone(),
            DeploySettings::default(),
        ));
        let deployment = service.deploy(spec("app")).await.unwrap();
        engine.delay_builds(Duration::from_millis(50));
        engine.clear_calls();

        let (a, b) = tokio::join!(
            service.redeploy(&deployment.id),
            service.redeploy(&deployment.id)
        );
        let a = a.unwrap().workload_id.unwrap();
        let b = b.unwrap().workload_id.unwrap();
        assert_ne!(a, b);

        let calls = engine.calls();
        let kinds: Vec<&str> = calls
            .iter()
            .map(|call| call.split(':').next().unwrap_or_default())
            .collect();
        assert_eq!(
            kinds,
            vec!["stop", "remove", "build", "create", "start", "stop", "remove", "build", "create", "start"]
        );
        // The second sequence retired exactly what the first one started
        assert_eq!(calls[4].trim_start_matches("start:"), calls[5].trim_start_matches("stop:"));

        let record = service.get_deployment(&deployment.id).await.unwrap();
        let last = calls[9].trim_start_matches("start:").to_string();
        assert_eq!(record.workload_id, Some(last));
        assert_eq!(engine.workloads().len(), 1);
    }

    #[tokio::test]
    async fn remove_deployment_removes_workload() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();

        service.remove_deployment(&deployment.id).await.unwrap();
        assert!(engine.workloads().is_empty());
        assert!(service.list_deployments().await.is_empty());
        assert!(matches!(
            service.remove_deployment(&deployment.id).await,
            Err(DeployError::DeploymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_workload_drops_owning_deployment() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        let deployment = service.deploy(spec("app")).await.unwrap();

        service
            .remove_workload(deployment.workload_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(service.list_deployments().await.is_empty());
    }

    #[tokio::test]
    async fn operator_failures_propagate_with_kind() {
        let engine = Arc::new(FakeEngine::default());
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);

        assert!(matches!(
            service.stop_workload("ghost").await,
            Err(DeployError::WorkloadNotFound(_))
        ));
        assert!(matches!(
            service.remove_workload("ghost").await,
            Err(DeployError::WorkloadNotFound(_))
        ));

        engine.insert_running("w-op", &[9000]);
        engine.fail_next_stop(Failure::Other);
        assert!(matches!(
            service.stop_workload("w-op").await,
            Err(DeployError::WorkloadOperationFailed { operation: "stop", .. })
        ));
        service.stop_workload("w-op").await.unwrap();
        assert!(!engine.workload("w-op").unwrap().is_running());
        service.start_workload("w-op").await.unwrap();
        assert!(engine.workload("w-op").unwrap().is_running());
    }

    #[tokio::test]
    async fn next_available_port_reads_live_workloads() {
        let engine = Arc::new(FakeEngine::default());
        engine.insert_running("a", &[8000]);
        let fetcher = Arc::new(FakeFetcher::new());
        let service = service(&engine, &fetcher);
        assert_eq!(service.next_available_port().await.unwrap(), 8001);
    }
}
