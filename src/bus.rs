//! Wire transport: capnp-rpc over a single dialed-out TCP connection.
//!
//! The launcher is the twoparty *client* — the same `VatNetwork`/
//! `RpcSystem`/`spawn_local` plumbing as a capnp-rpc listener, with the
//! vat sides swapped: most capnp services listen, this one dials out. The
//! launcher's own `Worker` capability is handed to `RpcSystem::new` as the
//! local bootstrap so the controller can call back on the same connection;
//! the controller's `Master` capability is obtained via `bootstrap()` and
//! used to push stats and events.

use std::fmt;
use std::net::SocketAddr;

use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::AsyncReadExt;
use tokio::sync::watch;
use tracing::warn;

use commands::common_capnp;
use commands::master_capnp::master;
use commands::worker_capnp::worker;

use crate::dto::{AggregateStats, DispatchError, InstanceVerb, OverseerHandle};
use crate::workload::{NicConfig, WorkloadConfig, WorkloadKind};

#[derive(Debug)]
pub enum BusError {
    Dial(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Dial(msg) => write!(f, "bus dial failed: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

pub struct MasterHandle {
    client: master::Client,
    worker_id: String,
    closed_rx: watch::Receiver<bool>,
}

impl MasterHandle {
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

pub async fn dial(config: &crate::config::Config, overseer: OverseerHandle, done_rx: watch::Receiver<bool>) -> Result<MasterHandle, BusError> {
    let addr: SocketAddr = config
        .server_url
        .parse()
        .map_err(|e| BusError::Dial(format!("invalid LAUNCHER_SERVER_URL: {e}")))?;

    let stream = tokio::net::TcpStream::connect(addr).await.map_err(|e| BusError::Dial(e.to_string()))?;
    stream.set_nodelay(true).map_err(|e| BusError::Dial(e.to_string()))?;

    let (reader, writer) = tokio_util::compat::TokioAsyncReadCompatExt::compat(stream).split();
    let network = Box::new(twoparty::VatNetwork::new(
        futures::io::BufReader::new(reader),
        futures::io::BufWriter::new(writer),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    ));

    let servant = WorkerServant { overseer, done_rx };
    let worker_client: worker::Client = capnp_rpc::new_client(servant);

    let mut rpc_system = RpcSystem::new(network, Some(worker_client.client));
    let master_client: master::Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);

    let (closed_tx, closed_rx) = watch::channel(false);
    tokio::task::spawn_local(async move {
        if let Err(e) = rpc_system.await {
            warn!(error = %e, "rpc system terminated");
        }
        let _ = closed_tx.send(true);
    });

    Ok(MasterHandle { client: master_client, worker_id: worker_id(), closed_rx })
}

fn worker_id() -> String {
    std::env::var("LAUNCHER_WORKER_ID").unwrap_or_else(|_| hostname_fallback())
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "launcher".to_string())
}

pub async fn push_stats(master: &MasterHandle, stats: &AggregateStats) {
    let mut request = master.client.report_stats_request();
    request.get().set_worker_id(master.worker_id.as_str().into());
    {
        let mut out = request.get().init_stats();
        out.set_total_cpu(stats.total_cpu);
        out.set_used_cpu(stats.used_cpu);
        out.set_total_mem_mb(stats.total_mem_mb);
        out.set_used_mem_mb(stats.used_mem_mb);
        out.set_total_disk_mb(stats.total_disk_mb);
        out.set_used_disk_mb(stats.used_disk_mb);
        out.set_instance_count(stats.instance_count as u32);
    }
    if let Err(e) = request.send().promise.await {
        warn!(error = %e, "report_stats failed");
    }
}

pub async fn push_rejected(master: &MasterHandle, instance_id: &str, reason: &str) {
    let mut request = master.client.report_rejected_request();
    request.get().set_worker_id(master.worker_id.as_str().into());
    request.get().set_instance_id(instance_id.into());
    request.get().set_reason(reason.into());
    if let Err(e) = request.send().promise.await {
        warn!(error = %e, "report_rejected failed");
    }
}

pub async fn push_instance_deleted(master: &MasterHandle, instance_id: &str) {
    let mut request = master.client.instance_deleted_request();
    request.get().set_worker_id(master.worker_id.as_str().into());
    request.get().set_instance_id(instance_id.into());
    if let Err(e) = request.send().promise.await {
        warn!(error = %e, "instance_deleted failed");
    }
}

pub async fn push_concentrator_instance_added(master: &MasterHandle, instance_id: &str, concentrator_id: &str, concentrator_ip: &str) {
    let mut request = master.client.concentrator_instance_added_request();
    request.get().set_worker_id(master.worker_id.as_str().into());
    request.get().set_instance_id(instance_id.into());
    request.get().set_concentrator_id(concentrator_id.into());
    request.get().set_concentrator_ip(concentrator_ip.into());
    if let Err(e) = request.send().promise.await {
        warn!(error = %e, "concentrator_instance_added failed");
    }
}

pub async fn push_trace_report(master: &MasterHandle, instance_id: &str, trace: &[(&'static str, std::time::Duration)]) {
    let mut request = master.client.trace_report_request();
    request.get().set_worker_id(master.worker_id.as_str().into());
    request.get().set_instance_id(instance_id.into());
    {
        let mut out = request.get().init_trace(trace.len() as u32);
        for (i, (stage, elapsed)) in trace.iter().enumerate() {
            let mut entry = out.reborrow().get(i as u32);
            entry.set_stage((*stage).into());
            entry.set_elapsed_ms(elapsed.as_millis() as u64);
        }
    }
    if let Err(e) = request.send().promise.await {
        warn!(error = %e, "trace_report failed");
    }
}

/// The capability the launcher exposes to the controller. Calls straight
/// into the overseer — no intermediary queue — from the capnp trait
/// methods themselves.
#[derive(Clone)]
struct WorkerServant {
    overseer: OverseerHandle,
    done_rx: watch::Receiver<bool>,
}

impl worker::Server for WorkerServant {
    fn dispatch(&mut self, params: worker::DispatchParams, mut results: worker::DispatchResults) -> capnp::capability::Promise<(), capnp::Error> {
        let params = match params.get() {
            Ok(p) => p,
            Err(e) => return capnp::capability::Promise::err(e),
        };
        let instance_id = match params.get_instance_id() {
            Ok(id) => id.to_string().unwrap_or_default(),
            Err(e) => return capnp::capability::Promise::err(e),
        };
        let command = match params.get_command() {
            Ok(c) => c,
            Err(e) => return capnp::capability::Promise::err(e),
        };
        let verb = match decode_command(command) {
            Ok(verb) => verb,
            Err(e) => return capnp::capability::Promise::err(e),
        };

        let overseer = self.overseer.clone();
        let done_rx = self.done_rx.clone();
        capnp::capability::Promise::from_future(async move {
            if *done_rx.borrow() {
                let mut result = results.get().init_result();
                let mut failure = result.init_failure();
                failure.set_verb(verb.name());
                failure.set_reason("shutting_down");
                return Ok(());
            }

            let outcome = overseer.dispatch(instance_id, verb).await;
            let mut result = results.get().init_result();
            match outcome {
                Ok(()) => result.set_ok(()),
                Err(DispatchError::LoopGone) => {
                    let mut failure = result.init_failure();
                    failure.set_verb("unknown");
                    failure.set_reason("loop_gone");
                }
                Err(DispatchError::Failure(f)) => {
                    let mut failure = result.init_failure();
                    failure.set_verb(f.verb());
                    failure.set_reason(&f.reason());
                }
            }
            Ok(())
        })
    }

    fn stats_status(&mut self, _params: worker::StatsStatusParams, mut results: worker::StatsStatusResults) -> capnp::capability::Promise<(), capnp::Error> {
        let overseer = self.overseer.clone();
        capnp::capability::Promise::from_future(async move {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if overseer.send(crate::dto::OverseerRequest::StatsStatus { reply: reply_tx }).await.is_err() {
                return Err(capnp::Error::failed("overseer unavailable".into()));
            }
            let stats = reply_rx.await.map_err(|_| capnp::Error::failed("overseer dropped reply".into()))?;
            let mut out = results.get().init_stats();
            out.set_total_cpu(stats.total_cpu);
            out.set_used_cpu(stats.used_cpu);
            out.set_total_mem_mb(stats.total_mem_mb);
            out.set_used_mem_mb(stats.used_mem_mb);
            out.set_total_disk_mb(stats.total_disk_mb);
            out.set_used_disk_mb(stats.used_disk_mb);
            out.set_instance_count(stats.instance_count as u32);
            Ok(())
        })
    }
}

fn decode_command(command: worker::command::Reader) -> Result<InstanceVerb, capnp::Error> {
    use worker::command::Which;
    match command.which()? {
        Which::Start(cfg) => Ok(InstanceVerb::Start(Box::new(decode_workload_config(cfg?)?))),
        Which::Restart(()) => Ok(InstanceVerb::Restart),
        Which::Stop(()) => Ok(InstanceVerb::Stop),
        Which::Delete(group) => Ok(InstanceVerb::Delete { suicide: group.get_suicide() }),
        Which::Monitor(()) => Ok(InstanceVerb::Monitor),
        Which::AttachVolume(id) => Ok(InstanceVerb::AttachVolume(id?.to_string().unwrap_or_default())),
        Which::DetachVolume(id) => Ok(InstanceVerb::DetachVolume(id?.to_string().unwrap_or_default())),
    }
}

fn decode_workload_config(reader: common_capnp::workload_config::Reader) -> Result<WorkloadConfig, capnp::Error> {
    let nic_reader = reader.get_nic()?;
    let nic = NicConfig {
        mac: text_opt(nic_reader.get_mac()?),
        ip: text_opt(nic_reader.get_ip()?),
        subnet: text_opt(nic_reader.get_subnet()?),
    };

    let mut volumes = std::collections::BTreeSet::new();
    for entry in reader.get_volumes()?.iter() {
        volumes.insert(entry?.to_string().unwrap_or_default());
    }

    Ok(WorkloadConfig {
        instance_id: reader.get_instance_id()?.to_string().unwrap_or_default(),
        tenant_id: reader.get_tenant_id()?.to_string().unwrap_or_default(),
        image_id: reader.get_image_id()?.to_string().unwrap_or_default(),
        cpus: reader.get_cpus(),
        memory_mb: reader.get_memory_mb(),
        disk_mb: reader.get_disk_mb(),
        legacy_firmware: reader.get_legacy_firmware(),
        kind: match reader.get_kind()? {
            common_capnp::WorkloadKind::Vm => WorkloadKind::Vm,
            common_capnp::WorkloadKind::Container => WorkloadKind::Container,
        },
        network_node: reader.get_network_node(),
        nic,
        concentrator_ip: text_opt(reader.get_concentrator_ip()?),
        concentrator_id: text_opt(reader.get_concentrator_id()?),
        volumes,
    })
}

fn text_opt(text: capnp::text::Reader<'_>) -> Option<String> {
    let s = text.to_string().unwrap_or_default();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

