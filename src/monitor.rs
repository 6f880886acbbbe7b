//! The monitor task's shared plumbing.
//!
//! Each virtualizer back-end spawns its own monitor task — the handshake and
//! event source differ too much between QMP sockets, container inspect
//! calls, and the simulation harness to share a single loop body — but all
//! three share the same channel shapes and the same ordering guarantee:
//! `connected` fires strictly before any observable `Running` transition,
//! and `closed` fires strictly after the backend has relinquished control.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Under `Adoption` the handshake tolerates a temporarily-absent control
/// socket (re-adopting a workload discovered on disk); under `FreshLaunch`
/// it fails fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    FreshLaunch,
    Adoption,
}

/// Commands the instance loop may send to a running monitor task.
pub enum MonitorCommand {
    /// Request a graceful power-off; the task acks once the hypervisor
    /// confirms, then closes `closed_ch` on its own exit path.
    Stop,
}

/// The three unidirectional channels the monitor protocol uses: `command`
/// is many-shot and closed from the instance side by dropping the sender;
/// `connected` and `closed` are single-shot, each closed at most once by the
/// monitor task.
pub struct MonitorHandles {
    pub command_tx: mpsc::Sender<MonitorCommand>,
    pub connected_rx: oneshot::Receiver<()>,
    pub closed_rx: oneshot::Receiver<()>,
    pub join: JoinHandle<()>,
}

/// Constructed by a backend when it spawns the monitor task; handed back to
/// the caller (the virtualizer's `monitor_vm`) alongside the command sender
/// so the task itself can signal the two single-shot channels exactly once.
pub struct MonitorSignals {
    pub connected_tx: Option<oneshot::Sender<()>>,
    pub closed_tx: Option<oneshot::Sender<()>>,
}

impl MonitorSignals {
    pub fn fire_connected(&mut self) {
        if let Some(tx) = self.connected_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn fire_closed(&mut self) {
        if let Some(tx) = self.closed_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn new_channels() -> (mpsc::Receiver<MonitorCommand>, mpsc::Sender<MonitorCommand>, oneshot::Sender<()>, oneshot::Receiver<()>, oneshot::Sender<()>, oneshot::Receiver<()>) {
    let (command_tx, command_rx) = mpsc::channel(1);
    let (connected_tx, connected_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    (command_rx, command_tx, connected_tx, connected_rx, closed_tx, closed_rx)
}
