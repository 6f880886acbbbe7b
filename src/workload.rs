//! The workload configuration (`vmConfig`) and its on-disk state blob.
//!
//! The full per-instance record: tenant identifier, container-vs-VM flag,
//! network-node flag, virtual NIC, concentrator, and the attached-volume
//! set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical snake_case spelling of the tenant-identifier field.
pub type TenantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Vm,
    Container,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NicConfig {
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub instance_id: String,
    pub tenant_id: TenantId,
    pub image_id: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub legacy_firmware: bool,
    pub kind: WorkloadKind,
    pub network_node: bool,
    pub nic: NicConfig,
    pub concentrator_ip: Option<String>,
    pub concentrator_id: Option<String>,
    #[serde(default)]
    pub volumes: BTreeSet<String>,
}

impl WorkloadConfig {
    pub fn networking_required(&self) -> bool {
        self.nic.ip.is_some() || self.nic.mac.is_some() || self.network_node
    }

    pub fn has_image(&self) -> bool {
        !self.image_id.is_empty()
    }
}

/// The per-instance directory and the `state` blob inside it.
pub struct InstanceDir {
    root: PathBuf,
}

impl InstanceDir {
    pub fn new(instance_root: &Path, instance_id: &str) -> Self {
        Self { root: instance_root.join(instance_id) }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn persist_state(&self, config: &WorkloadConfig) -> std::io::Result<()> {
        let encoded = serde_json::to_vec_pretty(config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(self.state_path(), encoded).await
    }

    pub async fn load_state(&self) -> std::io::Result<WorkloadConfig> {
        let raw = tokio::fs::read(self.state_path()).await?;
        serde_json::from_slice(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkloadConfig {
        WorkloadConfig {
            instance_id: "3390740c-0000-0000-0000-0000000002ce".into(),
            tenant_id: "tenant-a".into(),
            image_id: "59460b8a-0000-0000-0000-000000000064".into(),
            cpus: 2,
            memory_mb: 1024,
            disk_mb: 10_000,
            legacy_firmware: false,
            kind: WorkloadKind::Vm,
            network_node: false,
            nic: NicConfig { mac: None, ip: Some("10.1.0.5".into()), subnet: Some("10.1.0.0/24".into()) },
            concentrator_ip: None,
            concentrator_id: None,
            volumes: BTreeSet::new(),
        }
    }

    #[test]
    fn networking_required_follows_nic_presence() {
        let mut cfg = sample();
        assert!(cfg.networking_required());
        cfg.nic = NicConfig::default();
        cfg.network_node = false;
        assert!(!cfg.networking_required());
    }

    #[test]
    fn empty_image_id_is_rejected_by_has_image() {
        let mut cfg = sample();
        cfg.image_id = String::new();
        assert!(!cfg.has_image());
    }

    #[test]
    fn state_round_trips_through_json() {
        let cfg = sample();
        let encoded = serde_json::to_string(&cfg).unwrap();
        let decoded: WorkloadConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.instance_id, cfg.instance_id);
        assert_eq!(decoded.tenant_id, cfg.tenant_id);
    }
}
