//! The virtualizer capability: a single polymorphic contract with
//! three variants {QEMU-VM, container, simulation}.
//!
//! Modeled as a sum type matched by the instance loop, per the design notes'
//! guidance ("static dispatch via enum-matching... satisfies the contract").
//! Each variant's behavior lives in its own module; this file only defines
//! the shared capability shape and dispatches to it.

pub mod container;
pub mod qemu;
pub mod simulation;

use std::path::PathBuf;

use crate::error::VirtualizerError;
use crate::monitor::{BootMode, MonitorHandles};
use crate::workload::WorkloadConfig;

use container::ContainerVirtualizer;
use qemu::QemuVirtualizer;
use simulation::SimulationVirtualizer;

/// Result of `check_backing_image`: a third outcome beyond ok/error, since
/// the pipeline treats "not found" specially (it triggers a download
/// attempt rather than an immediate `image_failure`).
pub enum ImageCheck {
    Present,
    NotFound,
}

/// A synchronous resource snapshot. `-1` means "unknown / not yet
/// measurable", exactly as specified.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub disk_mb: i64,
    pub mem_mb: i64,
    pub cpu_pct: i64,
}

impl Stats {
    pub const UNKNOWN: Stats = Stats { disk_mb: -1, mem_mb: -1, cpu_pct: -1 };
}

pub enum Virtualizer {
    Qemu(QemuVirtualizer),
    Container(ContainerVirtualizer),
    Simulation(SimulationVirtualizer),
}

impl Virtualizer {
    pub fn init(config: WorkloadConfig, instance_dir: PathBuf) -> Self {
        if config.kind == crate::workload::WorkloadKind::Container {
            Virtualizer::Container(ContainerVirtualizer::init(config, instance_dir))
        } else {
            Virtualizer::Qemu(QemuVirtualizer::init(config, instance_dir))
        }
    }

    pub fn init_simulated(config: WorkloadConfig, instance_dir: PathBuf) -> Self {
        Virtualizer::Simulation(SimulationVirtualizer::init(config, instance_dir))
    }

    pub async fn check_backing_image(&self) -> Result<ImageCheck, VirtualizerError> {
        match self {
            Virtualizer::Qemu(v) => v.check_backing_image().await,
            Virtualizer::Container(v) => v.check_backing_image().await,
            Virtualizer::Simulation(v) => v.check_backing_image().await,
        }
    }

    pub async fn download_backing_image(&self) -> Result<(), VirtualizerError> {
        match self {
            Virtualizer::Qemu(v) => v.download_backing_image().await,
            Virtualizer::Container(v) => v.download_backing_image().await,
            Virtualizer::Simulation(v) => v.download_backing_image().await,
        }
    }

    /// Atomic: on any internal failure the backend removes partially created
    /// artifacts before returning, independent of the instance-directory
    /// cleanup the start pipeline performs at the outer level.
    pub async fn create_image(&self, bridge: Option<&str>, user_data: &str, meta_data: &str) -> Result<(), VirtualizerError> {
        match self {
            Virtualizer::Qemu(v) => v.create_image(bridge, user_data, meta_data).await,
            Virtualizer::Container(v) => v.create_image(bridge, user_data, meta_data).await,
            Virtualizer::Simulation(v) => v.create_image(bridge, user_data, meta_data).await,
        }
    }

    pub async fn delete_image(&self) {
        match self {
            Virtualizer::Qemu(v) => v.delete_image().await,
            Virtualizer::Container(v) => v.delete_image().await,
            Virtualizer::Simulation(v) => v.delete_image().await,
        }
    }

    pub async fn start_vm(&mut self, vnic_name: Option<&str>, host_ip: Option<&str>) -> Result<(), VirtualizerError> {
        match self {
            Virtualizer::Qemu(v) => v.start_vm(vnic_name, host_ip).await,
            Virtualizer::Container(v) => v.start_vm(vnic_name, host_ip).await,
            Virtualizer::Simulation(v) => v.start_vm(vnic_name, host_ip).await,
        }
    }

    pub fn monitor_vm(&self, boot_mode: BootMode, handshake_timeout_secs: u64) -> MonitorHandles {
        match self {
            Virtualizer::Qemu(v) => v.monitor_vm(boot_mode, handshake_timeout_secs),
            Virtualizer::Container(v) => v.monitor_vm(boot_mode, handshake_timeout_secs),
            Virtualizer::Simulation(v) => v.monitor_vm(boot_mode, handshake_timeout_secs),
        }
    }

    pub fn stats(&self) -> Stats {
        match self {
            Virtualizer::Qemu(v) => v.stats(),
            Virtualizer::Container(v) => v.stats(),
            Virtualizer::Simulation(v) => v.stats(),
        }
    }

    pub fn connected(&mut self) {
        match self {
            Virtualizer::Qemu(v) => v.connected(),
            Virtualizer::Container(v) => v.connected(),
            Virtualizer::Simulation(v) => v.connected(),
        }
    }

    pub fn lost_vm(&mut self) {
        match self {
            Virtualizer::Qemu(v) => v.lost_vm(),
            Virtualizer::Container(v) => v.lost_vm(),
            Virtualizer::Simulation(v) => v.lost_vm(),
        }
    }
}
