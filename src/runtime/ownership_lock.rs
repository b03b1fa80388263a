use super::logging::append_runtime_log;
use super::state_paths::StatePaths;
use super::supervisor::{load_supervisor_state, save_supervisor_state};
use crate::shared::errors::RuntimeError;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::time::now_secs;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    NotRunning,
    Running { pid: u32 },
    Stale,
}

#[derive(Debug, Clone)]
pub struct StopResult {
    pub pid: u32,
    pub forced: bool,
}

pub fn host_ownership_state(paths: &StatePaths) -> Result<OwnershipState, RuntimeError> {
    let state = load_supervisor_state(paths)?;
    if let Some(pid) = state.pid {
        if state.running && is_process_alive(pid) {
            return Ok(OwnershipState::Running { pid });
        }
    }

    if let Some(pid) = read_lock_pid(paths)? {
        if is_process_alive(pid) {
            return Ok(OwnershipState::Running { pid });
        }
        return Ok(OwnershipState::Stale);
    }

    if state.running || state.pid.is_some() {
        return Ok(OwnershipState::Stale);
    }

    Ok(OwnershipState::NotRunning)
}

/// Clear lock, stop file and the persisted running flag after a crash left
/// them behind.
pub fn cleanup_stale_host(paths: &StatePaths) -> Result<(), RuntimeError> {
    let lock = paths.supervisor_lock_path();
    if lock.exists() {
        let _ = fs::remove_file(&lock);
    }
    let stop = paths.stop_signal_path();
    if stop.exists() {
        let _ = fs::remove_file(&stop);
    }
    let mut state = load_supervisor_state(paths)?;
    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(paths, &state)
}

/// Exclusive start reservation: create-new semantics make the lock file the
/// race arbiter between two concurrent `start` invocations.
pub fn reserve_start_lock(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.supervisor_lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .and_then(|mut file| file.write_all(std::process::id().to_string().as_bytes()))
        .map_err(|source| RuntimeError::WriteLock {
            path: path.display().to_string(),
            source,
        })
}

pub fn write_host_lock_pid(paths: &StatePaths, pid: u32) -> Result<(), RuntimeError> {
    let path = paths.supervisor_lock_path();
    atomic_write_file(&path, pid.to_string().as_bytes()).map_err(|source| {
        RuntimeError::WriteLock {
            path: path.display().to_string(),
            source,
        }
    })
}

pub fn clear_start_lock(paths: &StatePaths) {
    let _ = fs::remove_file(paths.supervisor_lock_path());
}

pub fn spawn_host_process(state_root: &Path) -> Result<u32, RuntimeError> {
    let exe = std::env::current_exe().map_err(|e| RuntimeError::Spawn(e.to_string()))?;
    let child = Command::new(exe)
        .arg("__supervisor")
        .arg("--state-root")
        .arg(state_root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
    Ok(child.id())
}

/// The stop file is the only sanctioned shutdown signal; the supervisor
/// polls for it.
pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    fs::write(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Cooperative stop with escalation: stop file first, then TERM, then KILL.
pub fn stop_active_host(paths: &StatePaths, timeout: Duration) -> Result<StopResult, RuntimeError> {
    let pid = match host_ownership_state(paths)? {
        OwnershipState::Running { pid } => pid,
        OwnershipState::Stale => {
            cleanup_stale_host(paths)?;
            return Err(RuntimeError::NotRunning);
        }
        OwnershipState::NotRunning => return Err(RuntimeError::NotRunning),
    };

    signal_stop(paths)?;
    append_runtime_log(paths, "info", "host.stop.requested", &format!("pid={pid}"));

    let start = std::time::Instant::now();
    while is_process_alive(pid) && start.elapsed() < timeout {
        thread::sleep(Duration::from_millis(100));
    }

    let mut forced = false;
    if is_process_alive(pid) {
        send_signal(pid, "-TERM");
        let term_start = std::time::Instant::now();
        while is_process_alive(pid) && term_start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(100));
        }
    }

    if is_process_alive(pid) {
        forced = true;
        append_runtime_log(paths, "warn", "host.stop.force_kill", &format!("pid={pid}"));
        send_signal(pid, "-KILL");
        let kill_start = std::time::Instant::now();
        while is_process_alive(pid) && kill_start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(100));
        }
    }

    if is_process_alive(pid) {
        append_runtime_log(
            paths,
            "error",
            "host.stop.failed",
            &format!("pid={pid} remained alive after TERM/KILL"),
        );
        return Err(RuntimeError::StopFailedAlive { pid });
    }

    cleanup_stale_host(paths)?;
    Ok(StopResult { pid, forced })
}

fn read_lock_pid(paths: &StatePaths) -> Result<Option<u32>, RuntimeError> {
    let path = paths.supervisor_lock_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadLock {
        path: path.display().to_string(),
        source,
    })?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

fn send_signal(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
