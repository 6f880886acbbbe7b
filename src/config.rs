//! Process-wide configuration, collected once at startup.
//!
//! Replaces scattered package-level mutable state (bus URL, cert paths,
//! limit flags, networking mode, instance root) with a single immutable
//! struct. Built from the environment — no CLI flag parsing, which is an
//! explicit non-goal.

use std::path::PathBuf;

use crate::error::LauncherError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingMode {
    None,
    ComputeNode,
    NetworkNode,
    Dual,
}

impl NetworkingMode {
    fn parse(raw: &str) -> Result<Self, LauncherError> {
        match raw {
            "none" => Ok(NetworkingMode::None),
            "compute-node" => Ok(NetworkingMode::ComputeNode),
            "network-node" => Ok(NetworkingMode::NetworkNode),
            "dual" => Ok(NetworkingMode::Dual),
            other => Err(LauncherError::Config(format!(
                "invalid LAUNCHER_NETWORKING_MODE: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub compute_subnet: Option<String>,
    pub management_subnet: Option<String>,
    pub networking_mode: NetworkingMode,
    pub hard_reset: bool,
    pub disk_limit_enabled: bool,
    pub mem_limit_enabled: bool,
    pub simulate: bool,
    pub max_instances_cap: Option<usize>,
    pub instance_root: PathBuf,
    pub lock_dir: PathBuf,
    pub stats_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Total node capacity admission is checked against, alongside the
    /// FD-derived instance-count ceiling. Defaults approximate a modest
    /// bare-metal host when unset; production deployments are expected to
    /// set these explicitly.
    pub total_cpus: u32,
    pub total_mem_mb: u32,
    pub total_disk_mb: u32,
}

impl Config {
    /// Per-instance resource cost used to derive `max_instances` from the
    /// process's soft file-descriptor limit when no cap is configured.
    const FD_COST_PER_INSTANCE: u64 = 5;

    pub fn from_env() -> Result<Self, LauncherError> {
        let server_url = std::env::var("LAUNCHER_SERVER_URL")
            .map_err(|_| LauncherError::Config("LAUNCHER_SERVER_URL is required".into()))?;

        let networking_mode = match std::env::var("LAUNCHER_NETWORKING_MODE") {
            Ok(raw) => NetworkingMode::parse(&raw)?,
            Err(_) => NetworkingMode::None,
        };

        let instance_root = std::env::var("LAUNCHER_INSTANCE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/launcher/instances"));

        let lock_dir = std::env::var("LAUNCHER_LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/launcher/lock"));

        let max_instances_cap = match std::env::var("LAUNCHER_MAX_INSTANCES_CAP") {
            Ok(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|_| LauncherError::Config("LAUNCHER_MAX_INSTANCES_CAP must be a positive integer".into()))?,
            ),
            Err(_) => None,
        };

        Ok(Config {
            server_url,
            ca_cert_path: std::env::var("LAUNCHER_CA_CERT_PATH").ok().map(PathBuf::from),
            client_cert_path: std::env::var("LAUNCHER_CLIENT_CERT_PATH").ok().map(PathBuf::from),
            compute_subnet: std::env::var("LAUNCHER_COMPUTE_SUBNET").ok(),
            management_subnet: std::env::var("LAUNCHER_MANAGEMENT_SUBNET").ok(),
            networking_mode,
            hard_reset: bool_env("LAUNCHER_HARD_RESET"),
            disk_limit_enabled: bool_env_default("LAUNCHER_DISK_LIMIT_ENABLED", true),
            mem_limit_enabled: bool_env_default("LAUNCHER_MEM_LIMIT_ENABLED", true),
            simulate: bool_env("LAUNCHER_SIMULATE"),
            max_instances_cap,
            instance_root,
            lock_dir,
            stats_interval_secs: u64_env_default("LAUNCHER_STATS_INTERVAL_SECS", 30),
            handshake_timeout_secs: u64_env_default("LAUNCHER_HANDSHAKE_TIMEOUT_SECS", 30),
            total_cpus: u32_env_default("LAUNCHER_TOTAL_CPUS", default_total_cpus()),
            total_mem_mb: u32_env_default("LAUNCHER_TOTAL_MEM_MB", 65_536),
            total_disk_mb: u32_env_default("LAUNCHER_TOTAL_DISK_MB", 1_048_576),
        })
    }

    /// `max_instances = soft_fd_limit / 5`, capped by `max_instances_cap` when set.
    pub fn max_instances(&self) -> usize {
        let soft_limit = soft_fd_limit().unwrap_or(1024);
        let derived = (soft_limit / Self::FD_COST_PER_INSTANCE).max(1) as usize;
        match self.max_instances_cap {
            Some(cap) => derived.min(cap),
            None => derived,
        }
    }
}

fn bool_env(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn bool_env_default(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn u64_env_default(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn u32_env_default(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn default_total_cpus() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4)
}

#[cfg(unix)]
fn soft_fd_limit() -> Option<u64> {
    let mut limit = libc_rlimit();
    limit.take()
}

#[cfg(unix)]
fn libc_rlimit() -> Option<u64> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    let rlim = unsafe { rlim.assume_init() };
    Some(rlim.rlim_cur as u64)
}

#[cfg(not(unix))]
fn soft_fd_limit() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networking_mode_parses_recognized_values() {
        assert_eq!(NetworkingMode::parse("dual").unwrap(), NetworkingMode::Dual);
        assert!(NetworkingMode::parse("bogus").is_err());
    }
}
