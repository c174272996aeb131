use std::{fmt, path::PathBuf, time::Duration};

use anyhow::{Context, Error};
use config::Config;

#[derive(serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub docker_socket: String,
    pub listen_address: String,
    /// Shared secret for GitHub webhook signatures. The webhook endpoint refuses
    /// every delivery while this is unset.
    pub webhook_secret: Option<String>,
    pub checkout_directory: PathBuf,
    pub image_prefix: String,
    pub port_range_start: u16,
    pub container_port: u16,
    pub operation_timeout_secs: u64,
    pub stop_timeout_secs: i64,
    pub default_log_tail: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_string(),
            listen_address: "0.0.0.0:3000".to_string(),
            webhook_secret: None,
            checkout_directory: std::env::temp_dir().join("harbormaster").join("repos"),
            image_prefix: "harbormaster".to_string(),
            port_range_start: 8000,
            container_port: 80,
            operation_timeout_secs: 900,
            stop_timeout_secs: 10,
            default_log_tail: 100,
        }
    }
}

impl AppConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("docker_socket", &self.docker_socket)
            .field("listen_address", &self.listen_address)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("checkout_directory", &self.checkout_directory)
            .field("image_prefix", &self.image_prefix)
            .field("port_range_start", &self.port_range_start)
            .field("container_port", &self.container_port)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("stop_timeout_secs", &self.stop_timeout_secs)
            .field("default_log_tail", &self.default_log_tail)
            .finish()
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::Environment::with_prefix("harbormaster"))
        .build()
        .context("Can't load configuration")?;

    let config: AppConfig = config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")?;

    // An empty variable is as good as no secret at all
    Ok(AppConfig {
        webhook_secret: config.webhook_secret.filter(|secret| !secret.is_empty()),
        ..config
    })
}
