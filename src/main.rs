use std::{error::Error, sync::Arc};

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use crate::config::load_config;
use domain::{DeploySettings, DeploymentService};
use infra::{
    docker::DockerContainerEngine,
    git::GitSourceFetcher,
    web::{router, AppState},
};
use log::{info, warn};
use secrecy::SecretString;
use tokio::net::TcpListener;

mod config;
mod domain;
mod infra;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Start Harbormaster - push-to-deploy for a single Docker host");

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let docker = Docker::connect_with_socket(&config.docker_socket, 120, API_DEFAULT_VERSION)
        .context("Can't connect to docker socket")?;

    let source_fetcher = GitSourceFetcher::new(config.checkout_directory.clone());
    let purged = source_fetcher.purge_stale_checkouts().await?;
    if purged > 0 {
        info!("Purged {} stale checkout(s) from {}", purged, config.checkout_directory.display());
    }

    let service = Arc::new(DeploymentService::new(
        Arc::new(DockerContainerEngine {
            docker,
            stop_timeout_secs: config.stop_timeout_secs,
        }),
        Arc::new(source_fetcher),
        DeploySettings {
            image_prefix: config.image_prefix.clone(),
            port_range_start: config.port_range_start,
            container_port: config.container_port,
            operation_timeout: config.operation_timeout(),
        },
    ));

    if config.webhook_secret.is_none() {
        warn!("HARBORMASTER_WEBHOOK_SECRET is not set: webhook deliveries will be refused");
    }
    let state = AppState {
        service,
        webhook_secret: config.webhook_secret.map(SecretString::from),
        default_log_tail: config.default_log_tail,
    };

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Can't bind {}", config.listen_address))?;
    info!("Listening on {}", config.listen_address);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
