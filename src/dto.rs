//! Message types exchanged between the agent loop, the overseer, and instance
//! loops.
//!
//! A oneshot-reply-over-mpsc idiom applied at two hierarchy levels instead
//! of one: agent → overseer, and overseer → instance. No capnp types
//! appear here — only plain Rust structs, decoded at the bus boundary in
//! `bus.rs` and encoded back to error frames there.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::error::VerbFailure;
use crate::workload::WorkloadConfig;

// ─── Instance-loop command surface ─────────────────────────────────────────

/// The full command set an instance loop accepts.
#[derive(Debug)]
pub enum InstanceVerb {
    Start(Box<WorkloadConfig>),
    Restart,
    Stop,
    Delete { suicide: bool },
    Monitor,
    AttachVolume(String),
    DetachVolume(String),
}

impl InstanceVerb {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceVerb::Start(_) => "start",
            InstanceVerb::Restart => "restart",
            InstanceVerb::Stop => "stop",
            InstanceVerb::Delete { .. } => "delete",
            InstanceVerb::Monitor => "monitor",
            InstanceVerb::AttachVolume(_) => "attach-volume",
            InstanceVerb::DetachVolume(_) => "detach-volume",
        }
    }
}

/// A command sent to a specific instance loop, paired with a oneshot reply.
pub struct InstanceMessage {
    pub verb: InstanceVerb,
    pub reply: oneshot::Sender<Result<(), VerbFailure>>,
}

/// Thin cloneable handle to an instance loop's inbox: the oneshot is
/// created internally, the caller only supplies the verb and awaits the
/// typed result.
#[derive(Clone)]
pub struct InstanceHandle(mpsc::Sender<InstanceMessage>);

impl InstanceHandle {
    pub fn new(tx: mpsc::Sender<InstanceMessage>) -> Self {
        Self(tx)
    }

    pub async fn dispatch(&self, verb: InstanceVerb) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = InstanceMessage { verb, reply: reply_tx };
        self.0.send(msg).await.map_err(|_| DispatchError::LoopGone)?;
        reply_rx.await.map_err(|_| DispatchError::LoopGone)?.map_err(DispatchError::Failure)
    }
}

/// Failure to even reach the instance loop, distinct from a typed verb
/// failure the loop itself returned.
#[derive(Debug)]
pub enum DispatchError {
    LoopGone,
    Failure(VerbFailure),
}

// ─── Overseer-owned instance bookkeeping ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub disk_mb: i64,
    pub mem_mb: i64,
    pub cpu_pct: i64,
}

/// How an overseer record came to exist: a genuinely launched workload, or
/// one discovered on disk at startup that the launcher is re-adopting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Launched,
    Adopted,
}

// ─── Agent → overseer command surface ──────────────────────────────────────

pub struct AggregateStats {
    pub total_cpu: u32,
    pub used_cpu: u32,
    pub total_mem_mb: u64,
    pub used_mem_mb: u64,
    pub total_disk_mb: u64,
    pub used_disk_mb: u64,
    pub instance_count: usize,
}

pub enum OverseerRequest {
    /// Route a bus-originated (or suicide-originated) command to the named
    /// instance, creating the instance loop first if the verb is `Start`.
    Dispatch { instance_id: String, verb: InstanceVerb, reply: oneshot::Sender<Result<(), VerbFailure>> },
    /// Update the cached running-state for an instance. Fire-and-forget,
    /// sent by an instance loop as it crosses state-machine transitions.
    StateChange { instance_id: String, state: RunState },
    /// Fold a periodic stats sample into the aggregate and per-instance cache.
    StatsUpdate { instance_id: String, usage: ResourceUsage },
    /// Synthesize an immediate aggregate report (used on bus connect).
    StatsStatus { reply: oneshot::Sender<AggregateStats> },
    /// Forward a start-timing trace rendered by an instance loop.
    TraceFrame { instance_id: String, trace: Vec<(&'static str, Duration)> },
    /// Sent by an instance loop's own delete cleanup, exactly once, right
    /// before it exits. The overseer removes the record in the same step
    /// the loop reports it and relays the event to the agent loop.
    InstanceDeleted { instance_id: String },
    /// Sent by an instance loop when a `network_node` workload reaches
    /// `Running`, relayed onward to the controller as a concentrator event.
    ConcentratorInstanceAdded { instance_id: String, concentrator_id: String, concentrator_ip: String },
}

pub struct OverseerMessage {
    pub request: OverseerRequest,
}

/// An event the overseer relays onward to the agent loop for the bus to
/// push to the controller. Distinct from `OverseerRequest`: these carry no
/// reply channel and are purely fire-and-forget from the overseer's side.
pub enum BusEvent {
    InstanceDeleted { instance_id: String },
    ConcentratorInstanceAdded { instance_id: String, concentrator_id: String, concentrator_ip: String },
    TraceReport { instance_id: String, trace: Vec<(&'static str, Duration)> },
}

#[derive(Clone)]
pub struct OverseerHandle(mpsc::Sender<OverseerMessage>);

impl OverseerHandle {
    pub fn new(tx: mpsc::Sender<OverseerMessage>) -> Self {
        Self(tx)
    }

    pub async fn send(&self, request: OverseerRequest) -> Result<(), ()> {
        self.0.send(OverseerMessage { request }).await.map_err(|_| ())
    }

    pub async fn dispatch(&self, instance_id: String, verb: InstanceVerb) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(OverseerRequest::Dispatch { instance_id, verb, reply: reply_tx })
            .await
            .map_err(|_| DispatchError::LoopGone)?;
        reply_rx.await.map_err(|_| DispatchError::LoopGone)?.map_err(DispatchError::Failure)
    }
}

/// A monotonic instant paired with a pipeline-stage label, used to build the
/// start-timing record. Rendered to a trace exactly once, on `connected`.
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    pub stage: &'static str,
    pub at: Instant,
}
