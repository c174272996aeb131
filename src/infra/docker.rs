use std::{collections::HashMap, path::Path};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as DockerError,
    image::BuildImageOptions,
    secret::{ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding},
    Docker,
};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use futures::{future, TryStreamExt};
use itertools::Itertools;
use log::{info, warn};
use map_macro::hash_map;

use crate::domain::{
    error::EngineError,
    model::{PortMapping, Workload},
    port::ContainerEngine,
};

const MANAGED_LABEL: &str = "harbormaster.managed";
const NAME_LABEL: &str = "harbormaster.workload.name";

pub struct DockerContainerEngine {
    pub docker: Docker,
    pub stop_timeout_secs: i64,
}

#[async_trait]
impl ContainerEngine for DockerContainerEngine {
    async fn list_workloads(&self) -> Result<Vec<Workload>, Error> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("Can't list containers")?;
        Ok(containers.into_iter().map(summary_to_workload).collect())
    }

    async fn inspect_workload(&self, id: &str) -> Result<Option<Workload>, Error> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(Some(inspect_to_workload(container))),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(Error::new(e).context(format!("Can't inspect container {}", id))),
        }
    }

    async fn build_image(
        &self,
        context: &Path,
        build_file: &str,
        image_tag: &str,
    ) -> Result<String, Error> {
        let context = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || archive_build_context(&context))
            .await
            .context("Build context archiving task failed")??;

        info!("Build image {}", image_tag);
        self.docker
            .build_image(
                BuildImageOptions {
                    dockerfile: build_file.to_string(),
                    t: image_tag.to_string(),
                    rm: true,
                    forcerm: true,
                    ..Default::default()
                },
                None,
                Some(archive),
            )
            .map_err(|e| Error::new(e).context(format!("Docker build of {} failed", image_tag)))
            .try_for_each(|step| {
                if let Some(error) = step.error {
                    return future::ready(Err(anyhow!(
                        "Docker build of {} failed: {}",
                        image_tag,
                        error
                    )));
                }
                if let Some(output) = step.stream.as_deref().map(str::trim_end) {
                    if !output.is_empty() {
                        info!("Build {} => {}", image_tag, output);
                    }
                }
                future::ready(Ok(()))
            })
            .await?;
        Ok(image_tag.to_string())
    }

    async fn create_workload(
        &self,
        image: &str,
        name: &str,
        port_mappings: &[PortMapping],
        environment: &HashMap<String, String>,
    ) -> Result<String, EngineError> {
        let config = Config {
            image: Some(image.to_string()),
            env: Some(
                environment
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .sorted()
                    .collect(),
            ),
            exposed_ports: Some(
                port_mappings
                    .iter()
                    .map(|mapping| (port_key(mapping), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(HostConfig {
                port_bindings: Some(
                    port_mappings
                        .iter()
                        .map(|mapping| {
                            (
                                port_key(mapping),
                                Some(vec![PortBinding {
                                    host_ip: None,
                                    host_port: Some(mapping.host_port.to_string()),
                                }]),
                            )
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            labels: Some(workload_labels(name)),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| engine_error(e, name))?;
        for warning in &container.warnings {
            warn!("Creating container {} => {}", name, warning);
        }
        info!("Created container {} with name {}", container.id, name);
        Ok(container.id)
    }

    async fn start_workload(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => info!("Started container {}", id),
            // Already running
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(engine_error(e, id)),
        }
        Ok(())
    }

    async fn stop_workload(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: self.stop_timeout_secs,
                }),
            )
            .await
        {
            Ok(()) => info!("Stopped container {}", id),
            // Already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(engine_error(e, id)),
        }
        Ok(())
    }

    async fn remove_workload(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_error(e, id))?;
        info!("Removed container {}", id);
        Ok(())
    }

    async fn fetch_logs(&self, id: &str, tail_lines: usize) -> Result<String, Error> {
        let lines: Vec<String> = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: tail_lines.to_string(),
                    ..Default::default()
                }),
            )
            .map_ok(|output| output.to_string())
            .try_collect()
            .await
            .with_context(|| format!("Can't fetch logs of container {}", id))?;
        Ok(lines.concat())
    }
}

/// Gzipped tarball of a build context directory, as expected by the Docker build endpoint.
fn archive_build_context(context: &Path) -> Result<bytes::Bytes, Error> {
    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(".", context)
        .with_context(|| format!("Can't archive build context {}", context.display()))?;
    let tar_gz = tar.into_inner()?.finish()?;
    Ok(tar_gz.into_inner().freeze())
}

fn port_key(mapping: &PortMapping) -> String {
    format!("{}/{}", mapping.container_port, mapping.protocol)
}

fn engine_error(error: DockerError, subject: &str) -> EngineError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(subject.to_string()),
        DockerError::DockerResponseServerError { ref message, .. }
            if is_port_conflict(message) =>
        {
            EngineError::PortConflict(conflicting_port(message).unwrap_or_default())
        }
        other => EngineError::Other(Error::new(other).context(format!("Docker call on {} failed", subject))),
    }
}

fn workload_labels(name: &str) -> HashMap<String, String> {
    hash_map! {
        MANAGED_LABEL.to_string() => "true".to_string(),
        NAME_LABEL.to_string() => name.to_string(),
    }
}

fn is_port_conflict(message: &str) -> bool {
    message.contains("port is already allocated") || message.contains("address already in use")
}

/// Extracts the host port from Docker's "Bind for 0.0.0.0:8000 failed" wording.
fn conflicting_port(message: &str) -> Option<u16> {
    let (_, rest) = message.split_once("Bind for ")?;
    let (address, _) = rest.split_once(" failed")?;
    address.rsplit(':').next()?.parse().ok()
}

fn summary_to_workload(container: ContainerSummary) -> Workload {
    let id = container.id.unwrap_or_default();
    let name = container
        .names
        .and_then(|names| names.first().map(|name| name.trim_start_matches('/').to_string()))
        .unwrap_or_else(|| id.chars().take(12).collect());
    let status = container.status.unwrap_or_default();
    let created_at = container
        .created
        .and_then(|created| DateTime::<Utc>::from_timestamp(created, 0));
    Workload {
        name,
        image: container.image.unwrap_or_default(),
        state: container.state.map(|state| state.to_string()).unwrap_or_default(),
        started_at: if status.starts_with("Up") { created_at } else { None },
        status,
        created_at,
        ports: container
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| PortMapping {
                host_port: port.public_port.unwrap_or_default(),
                container_port: port.private_port,
                protocol: port
                    .typ
                    .map(|typ| typ.to_string())
                    .filter(|typ| !typ.is_empty())
                    .unwrap_or_else(|| "tcp".to_string()),
            })
            .unique()
            .collect(),
        environment: HashMap::new(),
        id,
    }
}

fn inspect_to_workload(container: ContainerInspectResponse) -> Workload {
    let id = container.id.unwrap_or_default();
    let state = container.state.unwrap_or_default();
    let config = container.config.unwrap_or_default();
    let status = state.status.map(|status| status.to_string()).unwrap_or_default();
    Workload {
        name: container
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.chars().take(12).collect()),
        image: config.image.unwrap_or_default(),
        state: status.clone(),
        status,
        created_at: container.created.as_deref().and_then(parse_docker_time),
        started_at: state.started_at.as_deref().and_then(parse_docker_time),
        ports: container
            .network_settings
            .and_then(|settings| settings.ports)
            .map(|ports| port_map_to_mappings(&ports))
            .unwrap_or_default(),
        environment: config
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        id,
    }
}

fn port_map_to_mappings(ports: &HashMap<String, Option<Vec<PortBinding>>>) -> Vec<PortMapping> {
    ports
        .iter()
        .flat_map(|(key, bindings)| {
            let (container_port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let container_port = container_port.parse().unwrap_or_default();
            bindings
                .iter()
                .flatten()
                .filter_map(|binding| binding.host_port.as_deref()?.parse().ok())
                .map(move |host_port| PortMapping {
                    host_port,
                    container_port,
                    protocol: protocol.to_string(),
                })
        })
        .unique()
        .sorted_by_key(|mapping| (mapping.host_port, mapping.container_port))
        .collect()
}

/// Docker reports unset timestamps as the zero time.
fn parse_docker_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
        .filter(|time| time.timestamp() > 0)
}
