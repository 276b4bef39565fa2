//! Worker fleet lifecycle: spawn stage binaries, track them by PID file,
//! terminate them gracefully with a force-kill escalation.
use crate::config::{PipelineConfig, args_from_config};
use mcmot_messages::Stage;
use std::{
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub(crate) enum FleetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("pid file pattern invalid: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Where a stage's binary lives: next to the controller when installed
/// together, otherwise resolved through `PATH`.
fn binary_path(stage: Stage) -> PathBuf {
    let name = stage.to_string();
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|sibling| sibling.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Spawns `replication-factor` workers per stage, logging to
/// `logs/<stage>-<i>.log` and recording PIDs in `pids/<stage>-<i>.pid`.
pub(crate) fn start(
    config: &PipelineConfig,
    pids_dir: &Path,
    logs_dir: &Path,
) -> Result<(), FleetError> {
    std::fs::create_dir_all(pids_dir)?;
    std::fs::create_dir_all(logs_dir)?;

    let brokers = config.bootstrap_servers.join(",");

    for worker in &config.stages {
        let replicas = worker.replicas();
        if replicas < worker.replication_factor {
            warn!(
                stage = %worker.name,
                requested = worker.replication_factor,
                "stage is single-instance, capping replication"
            );
        }
        let extra_args = args_from_config(&worker.config);

        for index in 0..replicas {
            let log = File::create(logs_dir.join(format!("{}-{index}.log", worker.name)))?;
            let err_log = log.try_clone()?;

            let mut command = Command::new(binary_path(worker.name));
            command
                .arg("--broker")
                .arg(&brokers)
                .arg("--pipeline")
                .arg(&config.pipeline)
                .args(&extra_args)
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(err_log));
            if worker.observability {
                // One scrape port per worker.
                command
                    .arg("--observability-address")
                    .arg(format!("127.0.0.1:{}", 9090 + index));
            }

            let child = command.spawn()?;
            let pid_path = pids_dir.join(format!("{}-{index}.pid", worker.name));
            std::fs::write(&pid_path, child.id().to_string())?;
            info!(stage = %worker.name, index, pid = child.id(), "worker started");
        }
    }
    Ok(())
}

/// Reads the PID files, sends SIGTERM, escalates to SIGKILL after the
/// grace period, then scans the process table for workers the PID files
/// missed.
pub(crate) fn stop(pipeline: &str, pids_dir: &Path, grace: Duration) -> Result<(), FleetError> {
    let mut pids: Vec<(PathBuf, i32)> = Vec::new();
    let pattern = pids_dir.join("*.pid");
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let Ok(path) = entry else { continue };
        match std::fs::read_to_string(&path).map(|s| s.trim().parse::<i32>()) {
            Ok(Ok(pid)) => pids.push((path, pid)),
            Ok(Err(e)) => warn!(path = %path.display(), "corrupt pid file: {e}"),
            Err(e) => warn!(path = %path.display(), "unreadable pid file: {e}"),
        }
    }

    for (_, pid) in &pids {
        info!(pid, "sending SIGTERM");
        // An ESRCH just means the worker is already gone.
        unsafe { libc::kill(*pid, libc::SIGTERM) };
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if pids.iter().all(|(_, pid)| !alive(*pid)) {
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    for (_, pid) in &pids {
        if alive(*pid) {
            warn!(pid, "grace period expired, sending SIGKILL");
            unsafe { libc::kill(*pid, libc::SIGKILL) };
        }
    }

    for (path, _) in &pids {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), "failed to remove pid file: {e}");
        }
    }

    scan_and_kill(pipeline);
    Ok(())
}

fn alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Fallback for workers whose PID files were lost: match stage binaries
/// carrying this pipeline name in their argv.
fn scan_and_kill(pipeline: &str) {
    let system = sysinfo::System::new_all();
    let stage_names: Vec<String> = Stage::iter().map(|stage| stage.to_string()).collect();

    for (pid, process) in system.processes() {
        let name = process.name().to_string_lossy();
        if !stage_names.iter().any(|stage| *stage == name) {
            continue;
        }
        let argv_has_pipeline = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy() == pipeline);
        if argv_has_pipeline {
            warn!(pid = pid.as_u32(), %name, "untracked worker found, killing");
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_tolerates_corrupt_and_stale_pid_files(){
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("detection-0.pid"), "not-a-pid").expect("write");
        // A pid that certainly refers to no process of ours.
        std::fs::write(dir.path().join("detection-1.pid"), "99999999").expect("write");

        stop("traffic", dir.path(), Duration::from_millis(10)).expect("stop succeeds");
        // The stale pid file was cleaned up; the corrupt one remains for
        // inspection.
        assert!(dir.path().join("detection-0.pid").exists());
        assert!(!dir.path().join("detection-1.pid").exists());
    }
}
