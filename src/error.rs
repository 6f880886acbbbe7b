//! Typed failure surfaces for the launcher core.
//!
//! Hand-rolled enums with manual `Display`/`Error` impls, not `thiserror`.
//! The verb-specific reason
//! enums are what actually crosses the bus as an error frame; `LauncherError`
//! is the catch-all used for process-fatal conditions and by the
//! configuration/virtualizer layers before they've been classified into a
//! reason code.

use std::fmt;

/// Reason codes for a failed `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFailure {
    AlreadyRunning,
    InstanceExists,
    InvalidData,
    ImageFailure,
    NetworkFailure,
    LaunchFailure,
    FullComputeNode,
}

impl StartFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartFailure::AlreadyRunning => "already_running",
            StartFailure::InstanceExists => "instance_exists",
            StartFailure::InvalidData => "invalid_data",
            StartFailure::ImageFailure => "image_failure",
            StartFailure::NetworkFailure => "network_failure",
            StartFailure::LaunchFailure => "launch_failure",
            StartFailure::FullComputeNode => "full_compute_node",
        }
    }

    /// Whether this failure is severe enough to trigger the suicide protocol.
    /// `instance_exists` is excluded: the existing workload must be left untouched.
    pub fn triggers_suicide(&self) -> bool {
        !matches!(self, StartFailure::InstanceExists | StartFailure::AlreadyRunning)
    }
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason codes for a failed `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFailure {
    AlreadyStopped,
    NoInstance,
}

impl StopFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopFailure::AlreadyStopped => "already_stopped",
            StopFailure::NoInstance => "no_instance",
        }
    }
}

impl fmt::Display for StopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason codes for a failed `restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartFailure {
    AlreadyRunning,
    NoInstance,
    LaunchFailure,
}

impl RestartFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartFailure::AlreadyRunning => "already_running",
            RestartFailure::NoInstance => "no_instance",
            RestartFailure::LaunchFailure => "launch_failure",
        }
    }
}

impl fmt::Display for RestartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason codes for a failed `delete`. Also reused for attach/detach-volume,
/// whose only documented failure is "no such instance".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFailure {
    NoInstance,
}

impl DeleteFailure {
    pub fn as_str(&self) -> &'static str {
        "no_instance"
    }
}

impl fmt::Display for DeleteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attach/detach-volume failures are not enumerated separately in the
/// taxonomy (only start/stop/restart/delete are enumerated); the only
/// documented condition that applies to them is "no such instance", so they
/// share `DeleteFailure`'s single reason code.
pub type VolumeFailure = DeleteFailure;

/// Per-verb typed failure, as marshaled into an outbound error frame.
#[derive(Debug, Clone, Copy)]
pub enum VerbFailure {
    Start(StartFailure),
    Stop(StopFailure),
    Restart(RestartFailure),
    Delete(DeleteFailure),
    AttachVolume(VolumeFailure),
    DetachVolume(VolumeFailure),
}

impl VerbFailure {
    pub fn verb(&self) -> &'static str {
        match self {
            VerbFailure::Start(_) => "start",
            VerbFailure::Stop(_) => "stop",
            VerbFailure::Restart(_) => "restart",
            VerbFailure::Delete(_) => "delete",
            VerbFailure::AttachVolume(_) => "attach-volume",
            VerbFailure::DetachVolume(_) => "detach-volume",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            VerbFailure::Start(r) => r.to_string(),
            VerbFailure::Stop(r) => r.to_string(),
            VerbFailure::Restart(r) => r.to_string(),
            VerbFailure::Delete(r) => r.to_string(),
            VerbFailure::AttachVolume(r) => r.to_string(),
            VerbFailure::DetachVolume(r) => r.to_string(),
        }
    }
}

impl fmt::Display for VerbFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_failure: {}", self.verb(), self.reason())
    }
}

/// Internal errors from virtualizer back-ends and the start pipeline, before
/// they've been classified into a `StartFailure` reason. Converted to a
/// `StartFailure` at the instance loop boundary (see `start::classify_virtualizer_error`).
#[derive(Debug)]
pub enum VirtualizerError {
    /// The backing image was not present and no download was attempted/possible.
    ImageNotFound,
    /// Image download or image-artifact creation failed.
    Image(String),
    /// Virtual NIC setup failed.
    Network(String),
    /// The hypervisor/container process failed to start or crashed immediately.
    Process(String),
    /// Any other backend failure not worth a specific variant.
    Other(String),
}

impl fmt::Display for VirtualizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtualizerError::ImageNotFound => write!(f, "backing image not found"),
            VirtualizerError::Image(msg) => write!(f, "image error: {msg}"),
            VirtualizerError::Network(msg) => write!(f, "network error: {msg}"),
            VirtualizerError::Process(msg) => write!(f, "process error: {msg}"),
            VirtualizerError::Other(msg) => write!(f, "virtualizer error: {msg}"),
        }
    }
}

impl std::error::Error for VirtualizerError {}

impl From<std::io::Error> for VirtualizerError {
    fn from(e: std::io::Error) -> Self {
        VirtualizerError::Other(e.to_string())
    }
}

/// Process-fatal conditions: abort with exit code 1 and a logged reason.
#[derive(Debug)]
pub enum LauncherError {
    LockContention(String),
    InstanceRootUnavailable(String),
    Config(String),
    BusDial(String),
    ShutdownTimeout,
}

impl fmt::Display for LauncherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LauncherError::LockContention(msg) => write!(f, "advisory lock contention: {msg}"),
            LauncherError::InstanceRootUnavailable(msg) => {
                write!(f, "instance root unavailable: {msg}")
            }
            LauncherError::Config(msg) => write!(f, "configuration error: {msg}"),
            LauncherError::BusDial(msg) => write!(f, "bus dial failed: {msg}"),
            LauncherError::ShutdownTimeout => write!(f, "shutdown grace period exceeded"),
        }
    }
}

impl std::error::Error for LauncherError {}
