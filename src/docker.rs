//! Container status lookups for readiness detection
//!
//! The pool never manages containers itself; `docker-compose` does. It only
//! needs to find the `<app>_web_1` container and read its health status.

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::HealthStatusEnum;
use bollard::Docker;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

/// A running container as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Container names without the leading `/`
    pub names: Vec<String>,
}

/// Health state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check configured, or not reported yet
    None,
}

impl From<Option<HealthStatusEnum>> for HealthStatus {
    fn from(status: Option<HealthStatusEnum>) -> Self {
        match status {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            _ => HealthStatus::None,
        }
    }
}

/// Source of container listings and health states
pub trait ContainerStatus: Send + Sync {
    fn list_containers(&self) -> BoxFuture<'_, anyhow::Result<Vec<ContainerSummary>>>;

    fn health<'a>(&'a self, id: &'a str) -> BoxFuture<'a, anyhow::Result<HealthStatus>>;
}

/// Find the id of the container named exactly `name`
pub fn find_container(containers: &[ContainerSummary], name: &str) -> Option<String> {
    containers
        .iter()
        .find(|c| c.names.iter().any(|n| n == name))
        .map(|c| c.id.clone())
}

/// Name of the web container docker-compose creates for an application
pub fn web_container_name(app: &str) -> String {
    format!("{}_web_1", app)
}

/// `ContainerStatus` backed by the Docker daemon
pub struct DockerStatus {
    docker_host: Option<String>,
    client: OnceCell<Docker>,
}

impl DockerStatus {
    /// Create a provider; the daemon is contacted on first use
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub fn new(docker_host: Option<String>) -> Self {
        Self {
            docker_host,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> anyhow::Result<&Docker> {
        self.client
            .get_or_try_init(|| async {
                let client = if let Some(host) = self.docker_host.as_deref() {
                    connect_to_host(host).map_err(|e| {
                        anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
                    })?
                } else if let Ok(host) = std::env::var("DOCKER_HOST") {
                    connect_to_host(&host).map_err(|e| {
                        anyhow::anyhow!(
                            "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                            host,
                            e
                        )
                    })?
                } else {
                    connect_with_defaults().await?
                };

                client.ping().await.map_err(|e| {
                    anyhow::anyhow!(
                        "Docker daemon is not responding: {}. \
                         Ensure Docker Desktop, Colima, or dockerd is running.",
                        e
                    )
                })?;

                debug!("Connected to Docker daemon");
                Ok(client)
            })
            .await
    }
}

impl ContainerStatus for DockerStatus {
    fn list_containers(&self) -> BoxFuture<'_, anyhow::Result<Vec<ContainerSummary>>> {
        async move {
            let client = self.client().await?;
            let options = ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            };

            let containers = client.list_containers(Some(options)).await?;
            Ok(containers
                .into_iter()
                .filter_map(|c| {
                    let id = c.id?;
                    let names = c
                        .names
                        .unwrap_or_default()
                        .into_iter()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .collect();
                    Some(ContainerSummary { id, names })
                })
                .collect())
        }
        .boxed()
    }

    fn health<'a>(&'a self, id: &'a str) -> BoxFuture<'a, anyhow::Result<HealthStatus>> {
        async move {
            let client = self.client().await?;
            let info = client
                .inspect_container(id, None::<InspectContainerOptions>)
                .await?;

            let status = info
                .state
                .and_then(|s| s.health)
                .and_then(|h| h.status);
            Ok(HealthStatus::from(status))
        }
        .boxed()
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if host.starts_with("unix://") {
        let socket_path = host.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
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
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried_paths = Vec::new();

    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue; // empty HOME or XDG_RUNTIME_DIR
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }
    }

    match Docker::connect_with_socket_defaults() {
        Ok(client) => Ok(client),
        Err(e) => {
            let tried_info = if tried_paths.is_empty() {
                "No Docker socket found at common locations".to_string()
            } else {
                format!("Tried:\n  - {}", tried_paths.join("\n  - "))
            };

            anyhow::bail!(
                "Cannot connect to Docker daemon. {}\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set docker_host in the [pool] configuration\n\n\
                 Underlying error: {}",
                tried_info,
                e
            )
        }
    }
}
