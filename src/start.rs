//! Start orchestration pipeline.
//!
//! Runs inside the instance loop's start handler: eight sequential,
//! fail-fast steps, each classified into a precise `StartFailure` reason.
//! Step 6's cleanup guarantee is expressed as an explicit RAII guard rather
//! than unwind-based cleanup.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{StartFailure, VirtualizerError};
use crate::virtualizer::{ImageCheck, Virtualizer};
use crate::workload::{InstanceDir, WorkloadConfig};

/// Start-timing record: wall-clock stamps for each pipeline stage,
/// rendered to a trace exactly once when `connected` fires, then discarded.
pub struct StartTiming {
    received: Instant,
    stamps: Vec<(&'static str, Instant)>,
}

impl StartTiming {
    pub fn begin() -> Self {
        Self { received: Instant::now(), stamps: Vec::new() }
    }

    fn mark(&mut self, stage: &'static str) {
        self.stamps.push((stage, Instant::now()));
    }

    /// Render to `(stage, elapsed-since-received)` pairs for a human-readable
    /// trace. Consumes `self` — the record is discarded after one render.
    pub fn render(self) -> Vec<(&'static str, Duration)> {
        self.stamps.into_iter().map(|(stage, at)| (stage, at.duration_since(self.received))).collect()
    }
}

/// Removes `path` on drop unless `disarm`ed. Cleanup runs synchronously
/// (Drop cannot be async) — acceptable because this guard only ever spans
/// the narrow window between creating the instance directory and
/// successfully persisting its state file.
struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

pub struct StartHandles {
    pub vnic_name: Option<String>,
    pub host_ip: Option<String>,
    pub timing: StartTiming,
}

/// Runs the full pipeline. On success the virtualizer has been told to
/// `start_vm`; the caller (the instance loop) is responsible for installing
/// the monitor task and arming its own state transition afterward.
pub async fn run(
    virtualizer: &mut Virtualizer,
    workload: &WorkloadConfig,
    instance_dir: &InstanceDir,
) -> Result<StartHandles, StartFailure> {
    let mut timing = StartTiming::begin();
    timing.mark("routed");

    // Step 1: instance directory must not already exist.
    if instance_dir.exists() {
        return Err(StartFailure::InstanceExists);
    }

    // Step 2: backing-image identifier must be present.
    if !workload.has_image() {
        return Err(StartFailure::InvalidData);
    }

    // Step 3: build the virtual-NIC configuration, if networking is enabled.
    let nic = if workload.networking_required() {
        Some(validate_nic(workload)?)
    } else {
        None
    };

    // Step 4: ensure the backing image is present.
    timing.mark("backing_image_check");
    match virtualizer.check_backing_image().await {
        Ok(ImageCheck::Present) => {}
        Ok(ImageCheck::NotFound) => {
            virtualizer.download_backing_image().await.map_err(|e| classify_virtualizer_error(&e))?;
        }
        Err(e) => return Err(classify_virtualizer_error(&e)),
    }

    // Step 5: create the virtual NIC, if required.
    timing.mark("network");
    let (vnic_name, host_ip) = match &nic {
        Some((mac, ip)) => (Some(create_vnic(mac)?), Some(ip.clone())),
        None => (None, None),
    };

    // Step 6: create the instance directory and the per-backend artifact;
    // persist the workload state. Any failure here removes the
    // partially-created directory.
    timing.mark("disk");
    instance_dir.create().await.map_err(|_| StartFailure::ImageFailure)?;
    let guard = CleanupGuard::new(instance_dir.path().to_path_buf());

    if let Err(e) = virtualizer.create_image(vnic_name.as_deref(), "", "").await {
        drop(guard);
        return Err(classify_virtualizer_error(&e));
    }
    if instance_dir.persist_state(workload).await.is_err() {
        drop(guard);
        return Err(StartFailure::ImageFailure);
    }
    guard.disarm();

    // Step 7: launch.
    timing.mark("launch");
    virtualizer.start_vm(vnic_name.as_deref(), host_ip.as_deref()).await.map_err(|e| classify_virtualizer_error(&e))?;

    // Step 8 (timing only — monitor install and state transition happen in
    // the instance loop, which owns the monitor channel set).
    Ok(StartHandles { vnic_name, host_ip, timing })
}

/// Validates the NIC fields present on the workload config and returns
/// `(mac, ip)`. Real link/bridge creation is an external collaborator; this
/// only performs the classification step the pipeline is responsible for.
fn validate_nic(workload: &WorkloadConfig) -> Result<(String, String), StartFailure> {
    let mac = workload.nic.mac.clone().filter(|s| !s.is_empty());
    let ip = workload.nic.ip.clone().filter(|s| !s.is_empty());
    match (mac, ip) {
        (Some(mac), Some(ip)) => Ok((mac, ip)),
        _ => Err(StartFailure::InvalidData),
    }
}

fn create_vnic(mac: &str) -> Result<String, StartFailure> {
    if mac.split(':').count() != 6 {
        return Err(StartFailure::NetworkFailure);
    }
    Ok(format!("tap-{}", &mac.replace(':', "")[..8.min(mac.len())]))
}

pub fn classify_virtualizer_error(err: &VirtualizerError) -> StartFailure {
    match err {
        VirtualizerError::ImageNotFound | VirtualizerError::Image(_) => StartFailure::ImageFailure,
        VirtualizerError::Network(_) => StartFailure::NetworkFailure,
        VirtualizerError::Process(_) => StartFailure::LaunchFailure,
        VirtualizerError::Other(_) => StartFailure::LaunchFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{NicConfig, WorkloadKind};
    use std::collections::BTreeSet;

    fn sample(instance_id: &str) -> WorkloadConfig {
        WorkloadConfig {
            instance_id: instance_id.into(),
            tenant_id: "tenant-a".into(),
            image_id: "59460b8a-0000-0000-0000-000000000064".into(),
            cpus: 2,
            memory_mb: 1024,
            disk_mb: 10_000,
            legacy_firmware: false,
            kind: WorkloadKind::Vm,
            network_node: false,
            nic: NicConfig { mac: Some("52:54:00:12:34:56".into()), ip: Some("10.1.0.5".into()), subnet: None },
            concentrator_ip: None,
            concentrator_id: None,
            volumes: BTreeSet::new(),
        }
    }

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("{prefix}-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[tokio::test]
    async fn empty_image_id_yields_invalid_data() {
        let mut workload = sample("t-1");
        workload.image_id.clear();
        let dir = InstanceDir::new(&std::env::temp_dir(), &unique_name("launcher-test"));
        let (v, _tracker) =
            crate::virtualizer::simulation::SimulationVirtualizer::with_failures(workload.clone(), dir.path().to_path_buf(), Default::default());
        let mut virt = Virtualizer::Simulation(v);
        let result = run(&mut virt, &workload, &dir).await;
        assert!(matches!(result, Err(StartFailure::InvalidData)));
    }

    #[tokio::test]
    async fn existing_instance_dir_yields_instance_exists() {
        let workload = sample("t-2");
        let dir = InstanceDir::new(&std::env::temp_dir(), &unique_name("launcher-test"));
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        let (v, _tracker) =
            crate::virtualizer::simulation::SimulationVirtualizer::with_failures(workload.clone(), dir.path().to_path_buf(), Default::default());
        let mut virt = Virtualizer::Simulation(v);
        let result = run(&mut virt, &workload, &dir).await;
        assert!(matches!(result, Err(StartFailure::InstanceExists)));
        let _ = tokio::fs::remove_dir_all(dir.path()).await;
    }
}
