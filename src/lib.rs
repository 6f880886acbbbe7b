pub mod agent;
pub mod bus;
pub mod config;
pub mod dto;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod overseer;
pub mod start;
pub mod virtualizer;
pub mod workload;

use tokio::sync::{mpsc, watch};
use tracing::info;

use config::Config;

/// Wires the three actor levels together and runs until the process-wide
/// done signal fires. Expected to run inside a `tokio::task::LocalSet`,
/// since the bus's `RpcSystem` future is `!Send`.
pub async fn run(config: Config) {
    let (done_tx, done_rx) = watch::channel(false);
    let (suicide_tx, suicide_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(16);
    let (overseer_tx, overseer_join) = overseer::spawn(config.clone(), suicide_tx, event_tx, done_rx.clone());

    adopt_existing_instances(&config, &overseer_tx).await;

    let agent_join = agent::spawn(config, overseer_tx, suicide_rx, event_rx, done_rx.clone());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    agent::AgentLoop::initiate_shutdown(&done_tx).await;

    let _ = agent_join.await;
    let _ = overseer_join.await;
}

/// Re-attaches every workload found under `instance_root` at startup,
/// before the agent loop starts accepting bus commands (the adoption path).
async fn adopt_existing_instances(config: &Config, overseer_tx: &mpsc::Sender<dto::OverseerMessage>) {
    let Ok(mut entries) = tokio::fs::read_dir(&config.instance_root).await else {
        return;
    };
    let overseer = dto::OverseerHandle::new(overseer_tx.clone());
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(instance_id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Err(e) = overseer.dispatch(instance_id.clone(), dto::InstanceVerb::Monitor).await {
            tracing::warn!(instance = %instance_id, error = ?e, "failed to adopt instance at startup");
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
