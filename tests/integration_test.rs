//! End-to-end scenarios against the full agent-less actor stack (overseer +
//! instance loops), driven through the simulation virtualizer backend so no
//! privileged setup (KVM, bridges, a container engine) is required.
//!
//! Run with: cargo test --test integration_test

use std::collections::BTreeSet;
use std::path::PathBuf;

use launcher::config::{Config, NetworkingMode};
use launcher::dto::{BusEvent, InstanceVerb, OverseerHandle, OverseerRequest};
use launcher::error::{StartFailure, VerbFailure};
use launcher::workload::{InstanceDir, NicConfig, WorkloadConfig, WorkloadKind};
use tokio::sync::{mpsc, watch};

fn test_config(root: PathBuf, max_instances_cap: Option<usize>) -> Config {
    Config {
        server_url: "127.0.0.1:0".into(),
        ca_cert_path: None,
        client_cert_path: None,
        compute_subnet: None,
        management_subnet: None,
        networking_mode: NetworkingMode::None,
        hard_reset: false,
        disk_limit_enabled: false,
        mem_limit_enabled: false,
        simulate: true,
        max_instances_cap,
        instance_root: root,
        lock_dir: std::env::temp_dir(),
        stats_interval_secs: 30,
        handshake_timeout_secs: 2,
        total_cpus: 64,
        total_mem_mb: 65_536,
        total_disk_mb: 1_048_576,
    }
}

fn sample_workload(instance_id: &str) -> WorkloadConfig {
    WorkloadConfig {
        instance_id: instance_id.into(),
        tenant_id: "tenant-a".into(),
        image_id: "image-1".into(),
        cpus: 1,
        memory_mb: 512,
        disk_mb: 2000,
        legacy_firmware: false,
        kind: WorkloadKind::Vm,
        network_node: false,
        nic: NicConfig::default(),
        concentrator_ip: None,
        concentrator_id: None,
        volumes: BTreeSet::new(),
    }
}

async fn spawn_overseer(config: Config) -> (OverseerHandle, tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (done_tx, done_rx) = watch::channel(false);
    let (suicide_tx, _suicide_rx) = mpsc::channel(16);
    let (event_tx, _event_rx) = mpsc::channel::<BusEvent>(16);
    let (tx, join) = launcher::overseer::spawn(config, suicide_tx, event_tx, done_rx);
    (OverseerHandle::new(tx), join, done_tx)
}

async fn instance_count(overseer: &OverseerHandle) -> usize {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    overseer.send(OverseerRequest::StatsStatus { reply: reply_tx }).await.unwrap();
    reply_rx.await.unwrap().instance_count
}

/// S1: a fresh start succeeds, the instance directory exists, and the
/// table carries exactly one record.
#[tokio::test]
async fn scenario_s1_fresh_start_creates_instance() {
    let root = std::env::temp_dir().join(format!("launcher-it-s1-{}", std::process::id()));
    tokio::fs::create_dir_all(&root).await.unwrap();
    let (overseer, join, done_tx) = spawn_overseer(test_config(root.clone(), None)).await;

    overseer.dispatch("s1-instance".into(), InstanceVerb::Start(Box::new(sample_workload("s1-instance")))).await.expect("start succeeds");

    assert_eq!(instance_count(&overseer).await, 1);
    assert!(InstanceDir::new(&root, "s1-instance").exists());

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

/// S2: deleting a running instance tears down its directory and removes
/// it from the table.
#[tokio::test]
async fn scenario_s2_delete_removes_instance() {
    let root = std::env::temp_dir().join(format!("launcher-it-s2-{}", std::process::id()));
    tokio::fs::create_dir_all(&root).await.unwrap();
    let (overseer, join, done_tx) = spawn_overseer(test_config(root.clone(), None)).await;

    overseer.dispatch("s2-instance".into(), InstanceVerb::Start(Box::new(sample_workload("s2-instance")))).await.unwrap();
    overseer.dispatch("s2-instance".into(), InstanceVerb::Delete { suicide: false }).await.expect("delete succeeds");

    assert!(!InstanceDir::new(&root, "s2-instance").exists());

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

/// S3 ("Absent" row): commands other than `start`/`monitor` against an
/// instance the overseer has never admitted fail immediately, with no
/// instance loop ever created.
#[tokio::test]
async fn scenario_s3_unknown_instance_commands_fail_without_admitting() {
    let root = std::env::temp_dir().join(format!("launcher-it-s3-{}", std::process::id()));
    tokio::fs::create_dir_all(&root).await.unwrap();
    let (overseer, join, done_tx) = spawn_overseer(test_config(root.clone(), None)).await;

    let stop = overseer.dispatch("ghost".into(), InstanceVerb::Stop).await;
    assert!(matches!(stop, Err(launcher::dto::DispatchError::Failure(VerbFailure::Stop(_)))));

    let delete = overseer.dispatch("ghost".into(), InstanceVerb::Delete { suicide: false }).await;
    assert!(matches!(delete, Err(launcher::dto::DispatchError::Failure(VerbFailure::Delete(_)))));

    assert_eq!(instance_count(&overseer).await, 0);

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

/// Admission control: once the node is at capacity, further starts fail
/// with `full_compute_node` rather than silently queuing.
#[tokio::test]
async fn admission_control_rejects_past_capacity() {
    let root = std::env::temp_dir().join(format!("launcher-it-cap-{}", std::process::id()));
    tokio::fs::create_dir_all(&root).await.unwrap();
    let (overseer, join, done_tx) = spawn_overseer(test_config(root.clone(), Some(1))).await;

    overseer.dispatch("cap-1".into(), InstanceVerb::Start(Box::new(sample_workload("cap-1")))).await.expect("first start admitted");

    let second = overseer.dispatch("cap-2".into(), InstanceVerb::Start(Box::new(sample_workload("cap-2")))).await;
    match second {
        Err(launcher::dto::DispatchError::Failure(VerbFailure::Start(StartFailure::FullComputeNode))) => {}
        other => panic!("expected full_compute_node, got {other:?}"),
    }

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

/// Admission control: a start whose resources would push the node's
/// aggregate past its configured total capacity fails with
/// `full_compute_node`, even though the instance-count cap is nowhere near
/// reached.
#[tokio::test]
async fn admission_control_rejects_past_resource_ceiling() {
    let root = std::env::temp_dir().join(format!("launcher-it-res-{}", std::process::id()));
    tokio::fs::create_dir_all(&root).await.unwrap();
    let mut config = test_config(root.clone(), None);
    config.total_cpus = 2;
    config.total_mem_mb = 1024;
    config.total_disk_mb = 4000;
    let (overseer, join, done_tx) = spawn_overseer(config).await;

    overseer.dispatch("res-1".into(), InstanceVerb::Start(Box::new(sample_workload("res-1")))).await.expect("first start fits capacity");

    let mut oversized = sample_workload("res-2");
    oversized.cpus = 2;
    let second = overseer.dispatch("res-2".into(), InstanceVerb::Start(Box::new(oversized))).await;
    match second {
        Err(launcher::dto::DispatchError::Failure(VerbFailure::Start(StartFailure::FullComputeNode))) => {}
        other => panic!("expected full_compute_node, got {other:?}"),
    }

    assert_eq!(instance_count(&overseer).await, 1);

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}

/// Starting an instance whose directory already exists fails fast with
/// `instance_exists`, without disturbing the existing directory contents.
#[tokio::test]
async fn start_on_existing_directory_fails_instance_exists() {
    let root = std::env::temp_dir().join(format!("launcher-it-exists-{}", std::process::id()));
    let dir = InstanceDir::new(&root, "already-there");
    dir.create().await.unwrap();
    let (overseer, join, done_tx) = spawn_overseer(test_config(root.clone(), None)).await;

    let result = overseer.dispatch("already-there".into(), InstanceVerb::Start(Box::new(sample_workload("already-there")))).await;
    match result {
        Err(launcher::dto::DispatchError::Failure(VerbFailure::Start(StartFailure::InstanceExists))) => {}
        other => panic!("expected instance_exists, got {other:?}"),
    }
    assert!(dir.exists());

    let _ = done_tx.send(true);
    let _ = join.await;
    let _ = tokio::fs::remove_dir_all(&root).await;
}
