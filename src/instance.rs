//! Instance loop: one actor per workload.
//!
//! Single-threaded event loop over a typed variant channel, generalizing the
//! reference's `Node`/`VmManager` pair — collapsed there into one task — into
//! its own task per workload, with its own monitor channel set and its own
//! suicide helper.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::dto::{DispatchError, InstanceMessage, InstanceVerb, OverseerHandle, OverseerRequest, ResourceUsage, RunState};
use crate::error::{DeleteFailure, RestartFailure, StartFailure, StopFailure, VerbFailure, VolumeFailure};
use crate::monitor::{BootMode, MonitorCommand, MonitorHandles};
use crate::start::StartTiming;
use crate::virtualizer::Virtualizer;
use crate::workload::{InstanceDir, WorkloadConfig};

/// The envelope a suicide helper writes to the agent loop's inbox.
pub struct SuicideEnvelope {
    pub instance_id: String,
}

/// Internal state variable distinguishing "no monitor attached" (either
/// never started, or the prior monitor reported `lost`) from an in-flight
/// start and a confirmed-live run. `ShuttingDown` is the orthogonal flag
/// raised once a suicide helper has been spawned.
enum InstanceState {
    Absent,
    Starting,
    Running,
    ShuttingDown,
}

pub struct InstanceActor {
    instance_id: String,
    inbox: mpsc::Receiver<InstanceMessage>,
    overseer: OverseerHandle,
    suicide_tx: mpsc::Sender<SuicideEnvelope>,
    done_rx: watch::Receiver<bool>,
    instance_root: PathBuf,
    stats_interval: Duration,
    handshake_timeout_secs: u64,
    simulate: bool,
    state: InstanceState,
    workload: Option<WorkloadConfig>,
    virtualizer: Option<Virtualizer>,
    monitor_command_tx: Option<mpsc::Sender<MonitorCommand>>,
    connected_rx: Option<oneshot::Receiver<()>>,
    closed_rx: Option<oneshot::Receiver<()>>,
    monitor_join: Option<tokio::task::JoinHandle<()>>,
    suicide_spawned: bool,
    /// Stashed between a successful `handle_start` and the `connected`
    /// signal — rendered to a trace exactly once `on_connected` fires, not
    /// at start time (the monitor hasn't confirmed liveness yet then).
    pending_timing: Option<StartTiming>,
}

pub fn spawn(
    instance_id: String,
    overseer: OverseerHandle,
    suicide_tx: mpsc::Sender<SuicideEnvelope>,
    done_rx: watch::Receiver<bool>,
    config: &Config,
) -> (mpsc::Sender<InstanceMessage>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let actor = InstanceActor {
        instance_id,
        inbox: rx,
        overseer,
        suicide_tx,
        done_rx,
        instance_root: config.instance_root.clone(),
        stats_interval: Duration::from_secs(config.stats_interval_secs),
        handshake_timeout_secs: config.handshake_timeout_secs,
        simulate: config.simulate,
        state: InstanceState::Absent,
        workload: None,
        virtualizer: None,
        monitor_command_tx: None,
        connected_rx: None,
        closed_rx: None,
        monitor_join: None,
        suicide_spawned: false,
        pending_timing: None,
    };
    let join = tokio::spawn(actor.run());
    (tx, join)
}

impl InstanceActor {
    fn instance_dir(&self) -> InstanceDir {
        InstanceDir::new(&self.instance_root, &self.instance_id)
    }

    fn init_virtualizer(&self, cfg: WorkloadConfig, instance_dir: PathBuf) -> Virtualizer {
        if self.simulate {
            Virtualizer::init_simulated(cfg, instance_dir)
        } else {
            Virtualizer::init(cfg, instance_dir)
        }
    }

    pub async fn run(mut self) {
        info!(instance = %self.instance_id, "instance loop started");

        let mut stats_timer = tokio::time::interval(self.stats_interval);
        stats_timer.reset();

        loop {
            let stats_armed = matches!(self.state, InstanceState::Running);

            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle_command(msg).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = async { self.connected_rx.as_mut().unwrap().await }, if self.connected_rx.is_some() => {
                    self.connected_rx = None;
                    self.on_connected().await;
                }
                _ = async { self.closed_rx.as_mut().unwrap().await }, if self.closed_rx.is_some() => {
                    self.closed_rx = None;
                    self.on_lost().await;
                }
                _ = stats_timer.tick(), if stats_armed => {
                    self.emit_stats().await;
                }
                changed = self.done_rx.changed() => {
                    if changed.is_err() || *self.done_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(instance = %self.instance_id, "instance loop exited");
    }

    /// Returns `true` if the loop should exit after this command.
    async fn handle_command(&mut self, msg: InstanceMessage) -> bool {
        let InstanceMessage { verb, reply } = msg;
        match (&self.state, verb) {
            (InstanceState::Absent, InstanceVerb::Start(cfg)) => self.handle_start(*cfg, reply).await,
            (InstanceState::Absent, InstanceVerb::Monitor) => self.handle_adopt(reply).await,
            (InstanceState::Absent, InstanceVerb::Restart) => {
                let _ = reply.send(Err(VerbFailure::Restart(RestartFailure::NoInstance)));
                false
            }
            (InstanceState::Absent, InstanceVerb::Stop) => {
                let _ = reply.send(Err(VerbFailure::Stop(StopFailure::NoInstance)));
                false
            }
            (InstanceState::Absent, InstanceVerb::Delete { .. }) => {
                self.run_delete_cleanup().await;
                let _ = reply.send(Ok(()));
                true
            }
            (InstanceState::Absent, InstanceVerb::AttachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::AttachVolume(VolumeFailure::NoInstance)));
                false
            }
            (InstanceState::Absent, InstanceVerb::DetachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::DetachVolume(VolumeFailure::NoInstance)));
                false
            }

            (InstanceState::Starting, InstanceVerb::Start(_) | InstanceVerb::Restart) => {
                let _ = reply.send(Err(VerbFailure::Start(StartFailure::AlreadyRunning)));
                false
            }
            (InstanceState::Starting, InstanceVerb::Stop) => {
                let _ = reply.send(Err(VerbFailure::Stop(StopFailure::AlreadyStopped)));
                false
            }
            (InstanceState::Starting, InstanceVerb::Delete { .. }) => {
                self.lost_vm();
                self.run_delete_cleanup().await;
                let _ = reply.send(Ok(()));
                true
            }
            (InstanceState::Starting, InstanceVerb::Monitor) => {
                let _ = reply.send(Ok(()));
                false
            }
            (InstanceState::Starting, InstanceVerb::AttachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::AttachVolume(VolumeFailure::NoInstance)));
                false
            }
            (InstanceState::Starting, InstanceVerb::DetachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::DetachVolume(VolumeFailure::NoInstance)));
                false
            }

            (InstanceState::Running, InstanceVerb::Start(_) | InstanceVerb::Restart) => {
                let _ = reply.send(Err(VerbFailure::Start(StartFailure::AlreadyRunning)));
                false
            }
            (InstanceState::Running, InstanceVerb::Stop) => {
                self.send_monitor_stop().await;
                let _ = reply.send(Ok(()));
                false
            }
            (InstanceState::Running, InstanceVerb::Delete { .. }) => {
                self.send_monitor_stop().await;
                self.lost_vm();
                self.run_delete_cleanup().await;
                let _ = reply.send(Ok(()));
                true
            }
            (InstanceState::Running, InstanceVerb::Monitor) => {
                let _ = reply.send(Ok(()));
                false
            }
            (InstanceState::Running, InstanceVerb::AttachVolume(volume_id)) => {
                self.attach_volume(volume_id).await;
                let _ = reply.send(Ok(()));
                false
            }
            (InstanceState::Running, InstanceVerb::DetachVolume(volume_id)) => {
                self.detach_volume(&volume_id).await;
                let _ = reply.send(Ok(()));
                false
            }

            (InstanceState::ShuttingDown, InstanceVerb::Start(_)) => {
                // "ignored": drop the reply without sending one. The caller
                // observes the channel close, identical to the loop being
                // gone outright — the controller will retry or time out.
                drop(reply);
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::Restart) => {
                let _ = reply.send(Err(VerbFailure::Restart(RestartFailure::NoInstance)));
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::Stop) => {
                let _ = reply.send(Err(VerbFailure::Stop(StopFailure::NoInstance)));
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::Delete { suicide: true }) => {
                self.run_delete_cleanup().await;
                let _ = reply.send(Ok(()));
                true
            }
            (InstanceState::ShuttingDown, InstanceVerb::Delete { suicide: false }) => {
                let _ = reply.send(Err(VerbFailure::Delete(DeleteFailure::NoInstance)));
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::Monitor) => {
                drop(reply);
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::AttachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::AttachVolume(VolumeFailure::NoInstance)));
                false
            }
            (InstanceState::ShuttingDown, InstanceVerb::DetachVolume(_)) => {
                let _ = reply.send(Err(VerbFailure::DetachVolume(VolumeFailure::NoInstance)));
                false
            }
        }
    }

    async fn handle_start(&mut self, cfg: WorkloadConfig, reply: oneshot::Sender<Result<(), VerbFailure>>) -> bool {
        let dir = self.instance_dir();
        let mut virtualizer = self.init_virtualizer(cfg.clone(), dir.path().to_path_buf());

        match crate::start::run(&mut virtualizer, &cfg, &dir).await {
            Ok(handles) => {
                let monitor_handles = virtualizer.monitor_vm(BootMode::FreshLaunch, self.handshake_timeout_secs);
                self.install_monitor(monitor_handles);
                self.workload = Some(cfg);
                self.virtualizer = Some(virtualizer);
                self.state = InstanceState::Starting;
                self.pending_timing = Some(handles.timing);
                let _ = reply.send(Ok(()));
                false
            }
            Err(failure) => {
                let _ = reply.send(Err(VerbFailure::Start(failure)));
                if failure.triggers_suicide() {
                    self.spawn_suicide_helper();
                    self.state = InstanceState::ShuttingDown;
                }
                false
            }
        }
    }

    /// Re-attach to a workload discovered on disk at startup (adoption
    /// path), loading its persisted state and installing a monitor with
    /// `BootMode::Adoption` instead of running the start pipeline.
    async fn handle_adopt(&mut self, reply: oneshot::Sender<Result<(), VerbFailure>>) -> bool {
        let dir = self.instance_dir();
        let cfg = match dir.load_state().await {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "adoption failed: no persisted state");
                let _ = reply.send(Err(VerbFailure::Start(StartFailure::InvalidData)));
                return false;
            }
        };
        let mut virtualizer = self.init_virtualizer(cfg.clone(), dir.path().to_path_buf());
        let monitor_handles = virtualizer.monitor_vm(BootMode::Adoption, self.handshake_timeout_secs);
        self.install_monitor(monitor_handles);
        self.workload = Some(cfg);
        self.virtualizer = Some(virtualizer);
        self.state = InstanceState::Starting;
        let _ = reply.send(Ok(()));
        false
    }

    fn install_monitor(&mut self, handles: MonitorHandles) {
        self.monitor_command_tx = Some(handles.command_tx);
        self.connected_rx = Some(handles.connected_rx);
        self.closed_rx = Some(handles.closed_rx);
        self.monitor_join = Some(handles.join);
    }

    async fn on_connected(&mut self) {
        info!(instance = %self.instance_id, "monitor connected");
        if let Some(v) = &mut self.virtualizer {
            v.connected();
        }
        self.state = InstanceState::Running;
        if let Some(timing) = self.pending_timing.take() {
            let trace = timing.render();
            let _ = self.overseer.send(OverseerRequest::TraceFrame { instance_id: self.instance_id.clone(), trace }).await;
        }
        let _ = self.overseer.send(OverseerRequest::StateChange { instance_id: self.instance_id.clone(), state: RunState::Running }).await;
        if let Some(cfg) = &self.workload {
            if cfg.network_node {
                let _ = self
                    .overseer
                    .send(OverseerRequest::ConcentratorInstanceAdded {
                        instance_id: self.instance_id.clone(),
                        concentrator_id: cfg.concentrator_id.clone().unwrap_or_default(),
                        concentrator_ip: cfg.concentrator_ip.clone().unwrap_or_default(),
                    })
                    .await;
            }
        }
    }

    async fn on_lost(&mut self) {
        info!(instance = %self.instance_id, "monitor closed (lost)");
        self.lost_vm();
        self.monitor_command_tx = None;
        self.state = InstanceState::Absent;
        let _ = self.overseer.send(OverseerRequest::StateChange { instance_id: self.instance_id.clone(), state: RunState::Stopped }).await;
    }

    fn lost_vm(&mut self) {
        if let Some(v) = &mut self.virtualizer {
            v.lost_vm();
        }
    }

    async fn send_monitor_stop(&mut self) {
        if let Some(tx) = &self.monitor_command_tx {
            let _ = tx.send(MonitorCommand::Stop).await;
        }
    }

    async fn emit_stats(&mut self) {
        let Some(v) = &self.virtualizer else { return };
        let stats = v.stats();
        let usage = ResourceUsage { disk_mb: stats.disk_mb, mem_mb: stats.mem_mb, cpu_pct: stats.cpu_pct };
        let _ = self.overseer.send(OverseerRequest::StatsUpdate { instance_id: self.instance_id.clone(), usage }).await;
    }

    async fn run_delete_cleanup(&mut self) {
        if let Some(v) = &self.virtualizer {
            v.delete_image().await;
        }
        let dir = self.instance_dir();
        if let Err(e) = dir.remove().await {
            warn!(instance = %self.instance_id, error = %e, "best-effort instance directory removal failed");
        }
        let _ = self.overseer.send(OverseerRequest::InstanceDeleted { instance_id: self.instance_id.clone() }).await;
    }

    fn spawn_suicide_helper(&mut self) {
        if self.suicide_spawned {
            return;
        }
        self.suicide_spawned = true;
        let instance_id = self.instance_id.clone();
        let suicide_tx = self.suicide_tx.clone();
        let mut done_rx = self.done_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = suicide_tx.send(SuicideEnvelope { instance_id }) => {}
                _ = done_rx.changed() => {}
            }
        });
    }

    async fn attach_volume(&mut self, volume_id: String) {
        if let Some(cfg) = &mut self.workload {
            cfg.volumes.insert(volume_id);
            let dir = self.instance_dir();
            let _ = dir.persist_state(cfg).await;
        }
    }

    async fn detach_volume(&mut self, volume_id: &str) {
        if let Some(cfg) = &mut self.workload {
            cfg.volumes.remove(volume_id);
            let dir = self.instance_dir();
            let _ = dir.persist_state(cfg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::{OverseerMessage, InstanceHandle};
    use crate::workload::{NicConfig, WorkloadKind};
    use std::collections::BTreeSet;

    fn sample_config(instance_id: &str) -> WorkloadConfig {
        WorkloadConfig {
            instance_id: instance_id.into(),
            tenant_id: "tenant-a".into(),
            image_id: "image-1".into(),
            cpus: 1,
            memory_mb: 256,
            disk_mb: 1000,
            legacy_firmware: false,
            kind: WorkloadKind::Vm,
            network_node: false,
            nic: NicConfig::default(),
            concentrator_ip: None,
            concentrator_id: None,
            volumes: BTreeSet::new(),
        }
    }

    fn test_config(root: PathBuf) -> Config {
        Config {
            server_url: "test://".into(),
            ca_cert_path: None,
            client_cert_path: None,
            compute_subnet: None,
            management_subnet: None,
            networking_mode: crate::config::NetworkingMode::None,
            hard_reset: false,
            disk_limit_enabled: false,
            mem_limit_enabled: false,
            simulate: true,
            max_instances_cap: None,
            instance_root: root,
            lock_dir: std::env::temp_dir(),
            stats_interval_secs: 30,
            handshake_timeout_secs: 2,
            total_cpus: 64,
            total_mem_mb: 65_536,
            total_disk_mb: 1_048_576,
        }
    }

    #[tokio::test]
    async fn start_then_delete_removes_instance_directory() {
        let root = std::env::temp_dir().join(format!("launcher-instance-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let config = test_config(root.clone());
        let (overseer_tx, mut overseer_rx) = mpsc::channel(8);
        let overseer = OverseerHandle::new(overseer_tx);
        let (suicide_tx, _suicide_rx) = mpsc::channel(8);
        let (_done_tx, done_rx) = watch::channel(false);

        tokio::spawn(async move {
            while let Some(OverseerMessage { .. }) = overseer_rx.recv().await {}
        });

        let (tx, _join) = spawn("t-start-delete".into(), overseer, suicide_tx, done_rx, &config);
        let handle = InstanceHandle::new(tx);

        let workload = sample_config("t-start-delete");
        handle.dispatch(InstanceVerb::Start(Box::new(workload))).await.expect("start should succeed");

        let dir = InstanceDir::new(&root, "t-start-delete");
        assert!(dir.exists());

        handle.dispatch(InstanceVerb::Delete { suicide: false }).await.expect("delete should succeed");
        assert!(!dir.exists());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn start_on_running_instance_fails_already_running() {
        let root = std::env::temp_dir().join(format!("launcher-instance-test2-{}", std::process::id()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let config = test_config(root.clone());
        let (overseer_tx, mut overseer_rx) = mpsc::channel(8);
        let overseer = OverseerHandle::new(overseer_tx);
        let (suicide_tx, _suicide_rx) = mpsc::channel(8);
        let (_done_tx, done_rx) = watch::channel(false);
        tokio::spawn(async move {
            while let Some(OverseerMessage { .. }) = overseer_rx.recv().await {}
        });

        let (tx, _join) = spawn("t-already-running".into(), overseer, suicide_tx, done_rx, &config);
        let handle = InstanceHandle::new(tx);

        handle.dispatch(InstanceVerb::Start(Box::new(sample_config("t-already-running")))).await.unwrap();
        let result = handle.dispatch(InstanceVerb::Start(Box::new(sample_config("t-already-running")))).await;
        match result {
            Err(DispatchError::Failure(VerbFailure::Start(StartFailure::AlreadyRunning))) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
