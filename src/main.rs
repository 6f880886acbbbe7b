use std::fs::OpenOptions;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use launcher::config::{Config, NetworkingMode};
use launcher::error::LauncherError;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .log_internal_errors(true)
                .with_target(false)
                .flatten_event(true)
                .with_span_list(false),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = prepare_filesystem(&config) {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    let _lock = match acquire_lock(&config) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    if config.hard_reset {
        if let Err(e) = hard_reset(&config).await {
            tracing::error!(error = %e, "hard reset failed");
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    let local = tokio::task::LocalSet::new();
    local.run_until(launcher::run(config)).await;
}

/// Enumerates every instance directory, best-effort kills the workload
/// recorded there, resets networking, and removes the directory. Not
/// reachable once the normal agent/overseer/instance stack has started.
async fn hard_reset(config: &Config) -> Result<(), LauncherError> {
    tracing::info!("hard reset: enumerating instance directories");
    let mut entries = tokio::fs::read_dir(&config.instance_root)
        .await
        .map_err(|e| LauncherError::InstanceRootUnavailable(e.to_string()))?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.path().is_dir() {
            continue;
        }
        let instance_id = entry.file_name().to_string_lossy().into_owned();

        let pid_path = entry.path().join("qemu.pid");
        if let Ok(raw) = tokio::fs::read_to_string(&pid_path).await {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                tracing::info!(instance = %instance_id, pid, "hard reset: killing workload");
                launcher::virtualizer::qemu::force_kill(pid);
            }
        }

        reset_networking(&instance_id, config);

        if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
            tracing::warn!(instance = %instance_id, error = %e, "hard reset: best-effort directory removal failed");
        }
    }

    tracing::info!("hard reset complete");
    Ok(())
}

fn reset_networking(instance_id: &str, config: &Config) {
    if config.networking_mode != NetworkingMode::None {
        tracing::info!(instance = %instance_id, "hard reset: resetting networking (best-effort)");
    }
}

fn prepare_filesystem(config: &Config) -> Result<(), LauncherError> {
    std::fs::create_dir_all(&config.instance_root)
        .map_err(|e| LauncherError::InstanceRootUnavailable(e.to_string()))?;
    std::fs::create_dir_all(&config.lock_dir).map_err(|e| LauncherError::InstanceRootUnavailable(e.to_string()))?;
    Ok(())
}

/// An advisory lock held for the lifetime of the process, so a second
/// launcher instance pointed at the same `instance_root` refuses to start
/// rather than racing the first one's state files.
struct NodeLock {
    #[allow(dead_code)]
    file: std::fs::File,
}

fn acquire_lock(config: &Config) -> Result<NodeLock, LauncherError> {
    let path = config.lock_dir.join("launcher.lock");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| LauncherError::LockContention(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(LauncherError::LockContention(format!("another launcher holds {}", path.display())));
        }
    }

    Ok(NodeLock { file })
}
