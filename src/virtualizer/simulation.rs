//! Simulation virtualizer back-end.
//!
//! No subprocess, no socket, no container engine — an in-memory stand-in
//! used by the test harness to drive every instance-loop and overseer code
//! path deterministically, including injected failures at each pipeline
//! step. Grounded directly on the reference's `vmm::mock::{MockBackend,
//! MockCallTracker}`, generalized from a single VM-manager call surface to
//! the full virtualizer capability set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::VirtualizerError;
use crate::monitor::{BootMode, MonitorCommand, MonitorHandles};
use crate::virtualizer::{ImageCheck, Stats};
use crate::workload::WorkloadConfig;

/// Which step(s) of the simulated lifecycle should fail, and how. All
/// `None` by default, i.e. everything succeeds.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFailures {
    pub image_missing: bool,
    pub download_fails: bool,
    pub create_image_fails: bool,
    pub start_vm_fails: bool,
    /// If set, the monitor never fires `connected_ch` (simulates a slow or
    /// stuck boot — used by scenario S5).
    pub never_connects: bool,
    /// If set, the monitor fires `closed_ch` shortly after connecting
    /// without any stop command (simulates a hypervisor crash — S4).
    pub crashes_after_connect: bool,
}

/// Shared call counters, analogous to `MockCallTracker`. Tests assert on
/// these to verify exactly which steps ran.
#[derive(Debug, Clone, Default)]
pub struct SimulationTracker {
    pub check_image: Arc<AtomicUsize>,
    pub download_image: Arc<AtomicUsize>,
    pub create_image: Arc<AtomicUsize>,
    pub delete_image: Arc<AtomicUsize>,
    pub start_vm: Arc<AtomicUsize>,
    pub monitor_spawns: Arc<AtomicUsize>,
}

impl SimulationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn create_image_count(&self) -> usize {
        self.create_image.load(Ordering::Relaxed)
    }

    pub fn delete_image_count(&self) -> usize {
        self.delete_image.load(Ordering::Relaxed)
    }
}

pub struct SimulationVirtualizer {
    config: WorkloadConfig,
    instance_dir: PathBuf,
    failures: SimulatedFailures,
    tracker: SimulationTracker,
    last_stats: Stats,
}

impl SimulationVirtualizer {
    pub fn init(config: WorkloadConfig, instance_dir: PathBuf) -> Self {
        Self {
            config,
            instance_dir,
            failures: SimulatedFailures::default(),
            tracker: SimulationTracker::new(),
            last_stats: Stats::UNKNOWN,
        }
    }

    pub fn with_failures(config: WorkloadConfig, instance_dir: PathBuf, failures: SimulatedFailures) -> (Self, SimulationTracker) {
        let tracker = SimulationTracker::new();
        let backend = Self { config, instance_dir, failures, tracker: tracker.clone(), last_stats: Stats::UNKNOWN };
        (backend, tracker)
    }

    pub fn tracker(&self) -> SimulationTracker {
        self.tracker.clone()
    }

    pub async fn check_backing_image(&self) -> Result<ImageCheck, VirtualizerError> {
        SimulationTracker::bump(&self.tracker.check_image);
        if self.failures.image_missing {
            Ok(ImageCheck::NotFound)
        } else {
            Ok(ImageCheck::Present)
        }
    }

    pub async fn download_backing_image(&self) -> Result<(), VirtualizerError> {
        SimulationTracker::bump(&self.tracker.download_image);
        if self.failures.download_fails {
            Err(VirtualizerError::Image("simulated download failure".into()))
        } else {
            Ok(())
        }
    }

    pub async fn create_image(&self, _bridge: Option<&str>, _user_data: &str, _meta_data: &str) -> Result<(), VirtualizerError> {
        SimulationTracker::bump(&self.tracker.create_image);
        if self.failures.create_image_fails {
            Err(VirtualizerError::Image("simulated create_image failure".into()))
        } else {
            Ok(())
        }
    }

    pub async fn delete_image(&self) {
        SimulationTracker::bump(&self.tracker.delete_image);
    }

    pub async fn start_vm(&mut self, _vnic_name: Option<&str>, _host_ip: Option<&str>) -> Result<(), VirtualizerError> {
        SimulationTracker::bump(&self.tracker.start_vm);
        if self.failures.start_vm_fails {
            Err(VirtualizerError::Process("simulated start_vm failure".into()))
        } else {
            self.last_stats = Stats { disk_mb: 0, mem_mb: 0, cpu_pct: 0 };
            Ok(())
        }
    }

    pub fn monitor_vm(&self, _boot_mode: BootMode, _handshake_timeout_secs: u64) -> MonitorHandles {
        SimulationTracker::bump(&self.tracker.monitor_spawns);
        let (command_rx, command_tx, connected_tx, connected_rx, closed_tx, closed_rx) = crate::monitor::new_channels();
        let failures = self.failures.clone();
        let join = tokio::spawn(run_simulated_monitor(failures, command_rx, connected_tx, closed_tx));
        MonitorHandles { command_tx, connected_rx, closed_rx, join }
    }

    pub fn stats(&self) -> Stats {
        self.last_stats
    }

    pub fn connected(&mut self) {}

    pub fn lost_vm(&mut self) {
        self.last_stats = Stats::UNKNOWN;
    }
}

async fn run_simulated_monitor(
    failures: SimulatedFailures,
    mut command_rx: tokio::sync::mpsc::Receiver<MonitorCommand>,
    connected_tx: tokio::sync::oneshot::Sender<()>,
    closed_tx: tokio::sync::oneshot::Sender<()>,
) {
    if failures.never_connects {
        // Hold the task alive so `delete` can race it (scenario S5), but
        // never signal connected; the instance loop will eventually treat
        // this as stuck if no deadline intervenes.
        let _ = command_rx.recv().await;
        return;
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    let _ = connected_tx.send(());

    if failures.crashes_after_connect {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = closed_tx.send(());
        return;
    }

    loop {
        match command_rx.recv().await {
            Some(MonitorCommand::Stop) => break,
            None => break,
        }
    }

    let _ = closed_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{NicConfig, WorkloadKind};
    use std::collections::BTreeSet;

    fn sample_config() -> WorkloadConfig {
        WorkloadConfig {
            instance_id: "sim-1".into(),
            tenant_id: "tenant".into(),
            image_id: "image-1".into(),
            cpus: 1,
            memory_mb: 512,
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

    #[tokio::test]
    async fn create_image_failure_is_observable() {
        let (v, tracker) = SimulationVirtualizer::with_failures(
            sample_config(),
            PathBuf::from("/tmp/sim-1"),
            SimulatedFailures { create_image_fails: true, ..Default::default() },
        );
        let result = v.create_image(None, "", "").await;
        assert!(result.is_err());
        assert_eq!(tracker.create_image_count(), 1);
    }

    #[tokio::test]
    async fn monitor_connects_before_closing_on_clean_stop() {
        let (v, _tracker) = SimulationVirtualizer::with_failures(sample_config(), PathBuf::from("/tmp/sim-1"), SimulatedFailures::default());
        let mut handles = v.monitor_vm(BootMode::FreshLaunch, 30);
        handles.connected_rx.await.expect("connected should fire");
        drop(handles.command_tx);
        handles.closed_rx.await.expect("closed should fire after command channel drops");
    }
}
