//! The overseer: singleton owning the instance table and the
//! node's aggregate resource accounting.
//!
//! Replaces a flat `HashMap<InstanceId, Handle>` plus ad hoc counters with
//! a typed record per instance and an explicit admission-control gate
//! driven by `Config::max_instances`.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::dto::{
    AggregateStats, BusEvent, InstanceHandle, InstanceVerb, OverseerMessage, OverseerRequest, Provenance, ResourceUsage, RunState,
};
use crate::error::{DeleteFailure, RestartFailure, StartFailure, StopFailure, VerbFailure, VolumeFailure};
use crate::instance::{self, SuicideEnvelope};
use crate::workload::InstanceDir;

struct InstanceRecord {
    handle: InstanceHandle,
    join: tokio::task::JoinHandle<()>,
    state: RunState,
    provenance: Provenance,
    usage: ResourceUsage,
    reserved_cpus: u32,
    reserved_mem_mb: u32,
    reserved_disk_mb: u32,
}

pub struct Overseer {
    inbox: mpsc::Receiver<OverseerMessage>,
    self_tx: mpsc::Sender<OverseerMessage>,
    suicide_tx: mpsc::Sender<SuicideEnvelope>,
    event_tx: mpsc::Sender<BusEvent>,
    done_rx: watch::Receiver<bool>,
    config: Config,
    instances: HashMap<String, InstanceRecord>,
}

pub fn spawn(
    config: Config,
    suicide_tx: mpsc::Sender<SuicideEnvelope>,
    event_tx: mpsc::Sender<BusEvent>,
    done_rx: watch::Receiver<bool>,
) -> (mpsc::Sender<OverseerMessage>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let overseer = Overseer { inbox: rx, self_tx: tx.clone(), suicide_tx, event_tx, done_rx, config, instances: HashMap::new() };
    let join = tokio::spawn(overseer.run());
    (tx, join)
}

impl Overseer {
    pub async fn run(mut self) {
        info!(max_instances = self.config.max_instances(), "overseer started");

        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg.request).await,
                        None => break,
                    }
                }
                changed = self.done_rx.changed() => {
                    if changed.is_err() || *self.done_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
        info!("overseer exited");
    }

    async fn handle(&mut self, request: OverseerRequest) {
        match request {
            OverseerRequest::Dispatch { instance_id, verb, reply } => {
                self.handle_dispatch(instance_id, verb, reply).await;
            }
            OverseerRequest::StateChange { instance_id, state } => {
                if let Some(record) = self.instances.get_mut(&instance_id) {
                    record.state = state;
                    if state == RunState::Stopped {
                        record.usage = ResourceUsage::default();
                    }
                }
            }
            OverseerRequest::StatsUpdate { instance_id, usage } => {
                if let Some(record) = self.instances.get_mut(&instance_id) {
                    record.usage = usage;
                }
            }
            OverseerRequest::StatsStatus { reply } => {
                let _ = reply.send(self.aggregate_stats());
            }
            OverseerRequest::TraceFrame { instance_id, trace } => {
                for (stage, elapsed) in &trace {
                    info!(instance = %instance_id, stage, ?elapsed, "start trace");
                }
                let _ = self.event_tx.send(BusEvent::TraceReport { instance_id, trace }).await;
            }
            OverseerRequest::InstanceDeleted { instance_id } => {
                self.instances.remove(&instance_id);
                let _ = self.event_tx.send(BusEvent::InstanceDeleted { instance_id }).await;
            }
            OverseerRequest::ConcentratorInstanceAdded { instance_id, concentrator_id, concentrator_ip } => {
                let _ = self.event_tx.send(BusEvent::ConcentratorInstanceAdded { instance_id, concentrator_id, concentrator_ip }).await;
            }
        }
    }

    async fn handle_dispatch(&mut self, instance_id: String, verb: InstanceVerb, reply: oneshot::Sender<Result<(), VerbFailure>>) {
        let known = self.instances.contains_key(&instance_id);

        if !known {
            // The "Absent" row of the per-instance table: every verb
            // but `start` is answered directly, with no instance loop ever
            // created for a workload that was never admitted.
            let failure = match verb {
                InstanceVerb::Start(_) | InstanceVerb::Monitor => None,
                InstanceVerb::Restart => Some(VerbFailure::Restart(RestartFailure::NoInstance)),
                InstanceVerb::Stop => Some(VerbFailure::Stop(StopFailure::NoInstance)),
                InstanceVerb::Delete { .. } => Some(VerbFailure::Delete(DeleteFailure::NoInstance)),
                InstanceVerb::AttachVolume(_) => Some(VerbFailure::AttachVolume(VolumeFailure::NoInstance)),
                InstanceVerb::DetachVolume(_) => Some(VerbFailure::DetachVolume(VolumeFailure::NoInstance)),
            };

            if let Some(failure) = failure {
                let _ = reply.send(Err(failure));
                return;
            }

            if let InstanceVerb::Start(cfg) = &verb {
                if self.instances.len() >= self.config.max_instances() {
                    let _ = reply.send(Err(VerbFailure::Start(StartFailure::FullComputeNode)));
                    return;
                }
                let (used_cpu, used_mem, used_disk) = self.reserved_totals();
                if used_cpu + cfg.cpus > self.config.total_cpus
                    || used_mem + cfg.memory_mb > self.config.total_mem_mb
                    || used_disk + cfg.disk_mb > self.config.total_disk_mb
                {
                    let _ = reply.send(Err(VerbFailure::Start(StartFailure::FullComputeNode)));
                    return;
                }
            }

            let (reserved_cpus, reserved_mem_mb, reserved_disk_mb) = match &verb {
                InstanceVerb::Start(cfg) => (cfg.cpus, cfg.memory_mb, cfg.disk_mb),
                InstanceVerb::Monitor => {
                    // Adoption path: the workload's resources were already
                    // persisted by a prior start, so reserve whatever the
                    // state blob records instead of zero.
                    let dir = InstanceDir::new(&self.config.instance_root, &instance_id);
                    match dir.load_state().await {
                        Ok(cfg) => (cfg.cpus, cfg.memory_mb, cfg.disk_mb),
                        Err(_) => (0, 0, 0),
                    }
                }
                _ => (0, 0, 0),
            };
            self.admit(instance_id.clone(), reserved_cpus, reserved_mem_mb, reserved_disk_mb);
            let record = self.instances.get(&instance_id).expect("just admitted");
            let handle = record.handle.clone();
            tokio::spawn(async move {
                let outcome = handle.dispatch(verb).await;
                let _ = reply.send(outcome.map_err(|e| match e {
                    crate::dto::DispatchError::LoopGone => VerbFailure::Start(StartFailure::LaunchFailure),
                    crate::dto::DispatchError::Failure(f) => f,
                }));
            });
            return;
        }

        let record = self.instances.get(&instance_id).expect("checked above");
        let handle = record.handle.clone();
        tokio::spawn(async move {
            let outcome = handle.dispatch(verb).await;
            let _ = reply.send(outcome.map_err(|e| match e {
                crate::dto::DispatchError::LoopGone => VerbFailure::Delete(DeleteFailure::NoInstance),
                crate::dto::DispatchError::Failure(f) => f,
            }));
        });
    }

    fn admit(&mut self, instance_id: String, reserved_cpus: u32, reserved_mem_mb: u32, reserved_disk_mb: u32) {
        let (tx, join) = instance::spawn(instance_id.clone(), self.self_handle(), self.suicide_tx.clone(), self.done_rx.clone(), &self.config);
        let handle = InstanceHandle::new(tx);
        self.instances.insert(
            instance_id,
            InstanceRecord {
                handle,
                join,
                state: RunState::Pending,
                provenance: Provenance::Launched,
                usage: ResourceUsage::default(),
                reserved_cpus,
                reserved_mem_mb,
                reserved_disk_mb,
            },
        );
    }

    fn reserved_totals(&self) -> (u32, u32, u32) {
        self.instances.values().fold((0, 0, 0), |(cpu, mem, disk), record| {
            (cpu + record.reserved_cpus, mem + record.reserved_mem_mb, disk + record.reserved_disk_mb)
        })
    }

    /// Instance loops report state changes and stats back through the same
    /// handle type the agent loop uses to dispatch commands.
    fn self_handle(&self) -> crate::dto::OverseerHandle {
        crate::dto::OverseerHandle::new(self.self_tx.clone())
    }

    fn aggregate_stats(&self) -> AggregateStats {
        let mut used_mem_mb = 0u64;
        let mut used_disk_mb = 0u64;
        for record in self.instances.values() {
            if record.usage.mem_mb > 0 {
                used_mem_mb += record.usage.mem_mb as u64;
            }
            if record.usage.disk_mb > 0 {
                used_disk_mb += record.usage.disk_mb as u64;
            }
        }
        let (reserved_cpu, _, _) = self.reserved_totals();
        AggregateStats {
            total_cpu: self.config.total_cpus,
            used_cpu: reserved_cpu,
            total_mem_mb: self.config.total_mem_mb as u64,
            used_mem_mb,
            total_disk_mb: self.config.total_disk_mb as u64,
            used_disk_mb,
            instance_count: self.instances.len(),
        }
    }

    async fn teardown(&mut self) {
        for (instance_id, record) in self.instances.drain() {
            let _ = record.handle.dispatch(InstanceVerb::Stop).await;
            let _ = record.join.await;
            info!(instance = %instance_id, "instance loop joined during teardown");
        }
    }
}
