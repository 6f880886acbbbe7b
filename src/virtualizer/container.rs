//! Container-engine virtualizer back-end.
//!
//! Talks to a local Docker-compatible engine over its Unix socket API via
//! `bollard`, in place of the QMP handshake: an inspect call stands in for
//! the QEMU capability handshake, and container state transitions
//! ({running, paused, restarting}) stand in for hypervisor liveness.

use std::path::PathBuf;
use std::time::Duration;

use bollard::container::{Config as ContainerConfig, RemoveContainerOptions};
use bollard::Docker;
use tracing::{info, warn};

use crate::error::VirtualizerError;
use crate::monitor::{BootMode, MonitorCommand, MonitorHandles};
use crate::virtualizer::{ImageCheck, Stats};
use crate::workload::WorkloadConfig;

pub struct ContainerVirtualizer {
    config: WorkloadConfig,
    instance_dir: PathBuf,
    container_id: Option<String>,
    last_stats: Stats,
}

impl ContainerVirtualizer {
    pub fn init(config: WorkloadConfig, instance_dir: PathBuf) -> Self {
        Self { config, instance_dir, container_id: None, last_stats: Stats::UNKNOWN }
    }

    fn container_name(&self) -> String {
        format!("launcher-{}", self.config.instance_id)
    }

    fn connect(&self) -> Result<Docker, VirtualizerError> {
        Docker::connect_with_local_defaults().map_err(|e| VirtualizerError::Other(e.to_string()))
    }

    pub async fn check_backing_image(&self) -> Result<ImageCheck, VirtualizerError> {
        let docker = self.connect()?;
        match docker.inspect_image(&self.config.image_id).await {
            Ok(_) => Ok(ImageCheck::Present),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(ImageCheck::NotFound),
            Err(e) => Err(VirtualizerError::Other(e.to_string())),
        }
    }

    pub async fn download_backing_image(&self) -> Result<(), VirtualizerError> {
        let docker = self.connect()?;
        let options = Some(bollard::image::CreateImageOptions { from_image: self.config.image_id.clone(), ..Default::default() });
        use futures::StreamExt;
        let mut stream = docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| VirtualizerError::Image(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn create_image(&self, _bridge: Option<&str>, _user_data: &str, _meta_data: &str) -> Result<(), VirtualizerError> {
        let docker = self.connect()?;
        let config = ContainerConfig {
            image: Some(self.config.image_id.clone()),
            host_config: Some(bollard::service::HostConfig {
                memory: Some((self.config.memory_mb as i64) * 1024 * 1024),
                nano_cpus: Some((self.config.cpus as i64) * 1_000_000_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = bollard::container::CreateContainerOptions { name: self.container_name(), platform: None };
        match docker.create_container(Some(options), config).await {
            Ok(response) => {
                // Note: `container_id` is cached via `connected()` once the
                // monitor confirms liveness, not here — creation alone does
                // not mean the container is running.
                let _ = response.id;
                Ok(())
            }
            Err(e) => Err(VirtualizerError::Image(e.to_string())),
        }
    }

    pub async fn delete_image(&self) {
        let Ok(docker) = self.connect() else { return };
        let options = Some(RemoveContainerOptions { force: true, ..Default::default() });
        if let Err(e) = docker.remove_container(&self.container_name(), options).await {
            warn!(instance = %self.config.instance_id, error = %e, "best-effort container removal failed");
        }
    }

    pub async fn start_vm(&mut self, _vnic_name: Option<&str>, _host_ip: Option<&str>) -> Result<(), VirtualizerError> {
        let docker = self.connect()?;
        docker
            .start_container::<String>(&self.container_name(), None)
            .await
            .map_err(|e| VirtualizerError::Process(e.to_string()))?;
        self.container_id = Some(self.container_name());
        info!(instance = %self.config.instance_id, "container started");
        Ok(())
    }

    pub fn monitor_vm(&self, boot_mode: BootMode, handshake_timeout_secs: u64) -> MonitorHandles {
        let (command_rx, command_tx, connected_tx, connected_rx, closed_tx, closed_rx) = crate::monitor::new_channels();
        let name = self.container_name();
        let join = tokio::spawn(run_container_monitor(name, boot_mode, handshake_timeout_secs, command_rx, connected_tx, closed_tx));
        MonitorHandles { command_tx, connected_rx, closed_rx, join }
    }

    pub fn stats(&self) -> Stats {
        self.last_stats
    }

    pub fn connected(&mut self) {}

    pub fn lost_vm(&mut self) {
        self.container_id = None;
        self.last_stats = Stats::UNKNOWN;
    }
}

async fn run_container_monitor(
    name: String,
    _boot_mode: BootMode,
    handshake_timeout_secs: u64,
    mut command_rx: tokio::sync::mpsc::Receiver<MonitorCommand>,
    connected_tx: tokio::sync::oneshot::Sender<()>,
    closed_tx: tokio::sync::oneshot::Sender<()>,
) {
    let Ok(docker) = Docker::connect_with_local_defaults() else {
        return;
    };

    let deadline = Duration::from_secs(handshake_timeout_secs);
    let start = tokio::time::Instant::now();
    loop {
        match docker.inspect_container(&name, None).await {
            Ok(inspect) => {
                let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
                if running {
                    break;
                }
            }
            Err(_) => {}
        }
        if start.elapsed() > deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let _ = connected_tx.send(());

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(MonitorCommand::Stop) => {
                        let _ = docker.stop_container(&name, None).await;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                match docker.inspect_container(&name, None).await {
                    Ok(inspect) => {
                        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
                        if !running {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let _ = closed_tx.send(());
}
