//! Docker implementation of the container runtime

use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeOp};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, info};

/// Seconds bollard waits on a single daemon request
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Runs service versions as local Docker containers
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd or Docker Desktop is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in candidates.iter().filter(|p| !p.starts_with("/.")) {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            debug!(path, "Found Docker socket");
            if let Ok(client) =
                Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. Set DOCKER_HOST or lifecycle.docker_host.",
                e
            )
        })
    }
}

fn server_status(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                let message = if server_status(&e) == Some(404) {
                    format!("image '{}' not found locally: {}", spec.image, e)
                } else {
                    e.to_string()
                };
                RuntimeError::new(RuntimeOp::Create, &spec.name, message)
            })?;

        info!(
            container_id = %response.id,
            container_name = %spec.name,
            image = %spec.image,
            host_port = spec.host_port,
            "Created Docker container"
        );
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::new(RuntimeOp::Start, container_id, e.to_string()))?;

        info!(container_id, "Started Docker container");
        Ok(())
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<(), RuntimeError> {
        let options = KillContainerOptions { signal };
        match self.client.kill_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, signal, "Killed Docker container");
                Ok(())
            }
            Err(e) => match server_status(&e) {
                Some(404) => {
                    debug!(container_id, "Container not found");
                    Ok(())
                }
                Some(409) => {
                    debug!(container_id, "Container not running");
                    Ok(())
                }
                _ => Err(RuntimeError::new(RuntimeOp::Kill, container_id, e.to_string())),
            },
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed Docker container");
                Ok(())
            }
            Err(e) if server_status(&e) == Some(404) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(RuntimeError::new(RuntimeOp::Remove, container_id, e.to_string())),
        }
    }
}
