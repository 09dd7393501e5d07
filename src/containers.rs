//! Container runtime capability interface and Docker adapter
//!
//! The engine consumes the runtime through the `ContainerRuntime` trait
//! (list/inspect/start/stop/stats); orchestration itself lives elsewhere.
//! `DockerRuntime` adapts the Docker daemon via bollard, and
//! `StatsWatcher` polls stats for running containers and publishes
//! snapshots on the event bus.

use anyhow::{Context, Result};
use bollard::container::{
    ListContainersOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{channels, BusEvent, EventBus};

/// Point-in-time view of one container
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

/// One stats sample for a running container
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub timestamp: DateTime<Utc>,
}

/// Capability interface over the container runtime
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn inspect(&self, id: &str) -> Result<ContainerInfo>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    /// One-shot stats sample
    async fn stats(&self, id: &str) -> Result<ContainerStats>;
}

/// Docker daemon adapter
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform default socket
    pub async fn new(docker_host: Option<&str>) -> Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .context("Cannot connect to Docker daemon via default socket")?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure dockerd is running or set DOCKER_HOST.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Cannot connect to Unix socket '{}'", socket_path))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Cannot connect to TCP endpoint '{}'", host))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path' or 'tcp://host:port'",
                host
            )
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(summaries
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let details = self
            .client
            .inspect_container(id, None)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))?;

        let state = details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: details.id.unwrap_or_default(),
            name: details
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: details.config.and_then(|c| c.image).unwrap_or_default(),
            status: state.clone(),
            state,
        })
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {}", id))?;
        info!(container_id = id, "Container started");
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.client
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .with_context(|| format!("Failed to stop container {}", id))?;
        info!(container_id = id, "Container stopped");
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let stats = self
            .client
            .stats(id, Some(options))
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("No stats returned for container {}", id))?
            .with_context(|| format!("Failed to read stats for container {}", id))?;

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

        let (network_rx, network_tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            container_id: id.to_string(),
            cpu_percent: cpu_percent(cpu_delta, system_delta, online_cpus),
            memory_used: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            network_rx,
            network_tx,
            timestamp: Utc::now(),
        })
    }
}

/// Standard Docker CPU percentage calculation
fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
}

/// Polls the runtime and publishes container snapshots and stats
///
/// Publishes a full listing on `containers` each tick, lifecycle events
/// when a container's state changes between ticks, and per-container
/// stats on `container-stats:<id>` for running containers.
pub struct StatsWatcher<R: ContainerRuntime> {
    runtime: Arc<R>,
    bus: Arc<EventBus>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    last_states: HashMap<String, String>,
}

impl<R: ContainerRuntime> StatsWatcher<R> {
    pub fn new(
        runtime: Arc<R>,
        bus: Arc<EventBus>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runtime,
            bus,
            interval,
            shutdown_rx,
            last_states: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Container stats watcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.poll_once().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Container stats watcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One polling pass; separated out for tests
    pub async fn poll_once(&mut self) {
        let containers = match self.runtime.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Failed to list containers");
                return;
            }
        };

        match serde_json::to_value(&containers) {
            Ok(data) => self
                .bus
                .publish(channels::CONTAINERS, &BusEvent::new("containers:list", data)),
            Err(e) => warn!(error = %e, "Failed to serialize container list"),
        }

        let mut current_states = HashMap::new();
        for container in &containers {
            current_states.insert(container.id.clone(), container.state.clone());

            match self.last_states.get(&container.id) {
                Some(prev) if prev != &container.state => {
                    let event = if container.state == "running" {
                        "container:started"
                    } else {
                        "container:stopped"
                    };
                    self.bus.publish(
                        channels::CONTAINERS,
                        &BusEvent::new(
                            event,
                            serde_json::json!({
                                "id": container.id,
                                "name": container.name,
                                "state": container.state,
                            }),
                        ),
                    );
                }
                _ => {}
            }

            if container.state == "running" {
                match self.runtime.stats(&container.id).await {
                    Ok(stats) => match serde_json::to_value(&stats) {
                        Ok(data) => self.bus.publish(
                            &channels::container_stats(&container.id),
                            &BusEvent::new("container:stats", data),
                        ),
                        Err(e) => warn!(error = %e, "Failed to serialize stats"),
                    },
                    Err(e) => {
                        debug!(container_id = container.id, error = %e, "Stats unavailable")
                    }
                }
            }
        }

        self.last_states = current_states;
    }
}
