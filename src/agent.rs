//! The agent loop: singleton owning the bus dial/reconnect state.
//!
//! Inbound commands never pass through this loop — `bus::WorkerServant`
//! calls the overseer directly from within the capnp `Worker::Server` impl,
//! the same way a capnp server capability calls straight into its owned
//! resource manager from the trait method body. This loop's own job is narrower:
//! hold the dial/reconnect state, push stats on (re)connect, and forward
//! suicide envelopes — both bus-independent, local operations.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::bus::{self, BusError};
use crate::config::Config;
use crate::dto::{BusEvent, InstanceVerb, OverseerHandle, OverseerMessage, OverseerRequest};
use crate::instance::SuicideEnvelope;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub struct AgentLoop {
    config: Config,
    overseer: OverseerHandle,
    suicide_rx: mpsc::Receiver<SuicideEnvelope>,
    event_rx: mpsc::Receiver<BusEvent>,
    done_rx: watch::Receiver<bool>,
}

pub fn spawn(
    config: Config,
    overseer_tx: mpsc::Sender<OverseerMessage>,
    suicide_rx: mpsc::Receiver<SuicideEnvelope>,
    event_rx: mpsc::Receiver<BusEvent>,
    done_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let agent = AgentLoop { config, overseer: OverseerHandle::new(overseer_tx), suicide_rx, event_rx, done_rx };
    tokio::task::spawn_local(agent.run())
}

impl AgentLoop {
    pub async fn run(mut self) {
        info!("agent loop started");

        'reconnect: loop {
            if *self.done_rx.borrow() {
                break;
            }

            let master = match bus::dial(&self.config, self.overseer.clone(), self.done_rx.clone()).await {
                Ok(master) => master,
                Err(e) => {
                    warn!(error = %e, "bus dial failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue 'reconnect,
                        changed = self.done_rx.changed() => {
                            if changed.is_err() || *self.done_rx.borrow() {
                                break 'reconnect;
                            }
                            continue 'reconnect;
                        }
                    }
                }
            };

            info!("bus connected");
            if let Ok(stats) = self.request_stats().await {
                bus::push_stats(&master, &stats).await;
            }

            loop {
                tokio::select! {
                    envelope = self.suicide_rx.recv() => {
                        match envelope {
                            Some(envelope) => self.handle_suicide(&master, envelope).await,
                            None => {}
                        }
                    }
                    event = self.event_rx.recv() => {
                        match event {
                            Some(event) => Self::handle_event(&master, event).await,
                            None => {}
                        }
                    }
                    _ = master.closed() => {
                        warn!("bus connection lost");
                        break;
                    }
                    changed = self.done_rx.changed() => {
                        if changed.is_err() || *self.done_rx.borrow() {
                            break 'reconnect;
                        }
                    }
                }
            }
        }

        info!("agent loop exited");
    }

    async fn handle_suicide(&mut self, master: &bus::MasterHandle, envelope: SuicideEnvelope) {
        if *self.done_rx.borrow() {
            return;
        }
        info!(instance = %envelope.instance_id, "forwarding suicide delete");
        let outcome = self.overseer.dispatch(envelope.instance_id.clone(), InstanceVerb::Delete { suicide: true }).await;
        if let Err(e) = outcome {
            bus::push_rejected(master, &envelope.instance_id, &format!("{e:?}")).await;
        }
    }

    async fn handle_event(master: &bus::MasterHandle, event: BusEvent) {
        match event {
            BusEvent::InstanceDeleted { instance_id } => {
                bus::push_instance_deleted(master, &instance_id).await;
            }
            BusEvent::ConcentratorInstanceAdded { instance_id, concentrator_id, concentrator_ip } => {
                bus::push_concentrator_instance_added(master, &instance_id, &concentrator_id, &concentrator_ip).await;
            }
            BusEvent::TraceReport { instance_id, trace } => {
                bus::push_trace_report(master, &instance_id, &trace).await;
            }
        }
    }

    async fn request_stats(&self) -> Result<crate::dto::AggregateStats, BusError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.overseer
            .send(OverseerRequest::StatsStatus { reply: reply_tx })
            .await
            .map_err(|_| BusError::Dial("overseer unavailable".into()))?;
        reply_rx.await.map_err(|_| BusError::Dial("overseer dropped reply".into()))
    }

    /// Signals every actor sharing `done_rx` (overseer and every instance
    /// loop) to exit, then waits out a grace period before the process
    /// itself exits.
    pub async fn initiate_shutdown(done_tx: &watch::Sender<bool>) {
        let _ = done_tx.send(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
