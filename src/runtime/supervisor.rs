use super::logging::append_runtime_log;
use super::ownership_lock;
use super::state_paths::{bootstrap_state_root, StatePaths};
use super::worker_registry::{apply_worker_event, WorkerEvent, WorkerHealth, WorkerState};
use super::workers::WorkerRunContext;
use super::{admission_worker, ipc_worker, scheduler_worker};
use crate::config::Settings;
use crate::groups::register_configured_groups;
use crate::session::SessionManager;
use crate::shared::errors::RuntimeError;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::time::now_secs;
use crate::store::HostStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WORKER_IDS: [&str; 3] = ["admission", "ipc", "scheduler"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub workers: BTreeMap<String, WorkerHealth>,
    pub last_error: Option<String>,
}

/// Foreground supervisor body. Runs until the stop file appears; nothing
/// else terminates the host.
pub fn run_supervisor(state_root: &Path, settings: Settings) -> Result<(), RuntimeError> {
    let paths = StatePaths::new(state_root);
    bootstrap_state_root(&paths)?;

    let stop_path = paths.stop_signal_path();
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }

    let store = HostStore::open(&paths.store_db_path())
        .map_err(|err| RuntimeError::Store(err.to_string()))?;
    let seeded = register_configured_groups(&store, &settings)
        .map_err(|err| RuntimeError::Store(err.to_string()))?;

    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        workers: BTreeMap::new(),
        last_error: None,
    };
    for worker_id in WORKER_IDS {
        state
            .workers
            .insert(worker_id.to_string(), WorkerHealth::default());
    }
    save_supervisor_state(&paths, &state)?;
    append_runtime_log(
        &paths,
        "info",
        "supervisor.started",
        &format!("pid={} groups={seeded}", std::process::id()),
    );

    let manager = Arc::new(SessionManager::new(
        settings.clone(),
        store.clone(),
        &paths.root,
    ));
    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
    let ctx = WorkerRunContext {
        paths: paths.clone(),
        settings,
        store,
        manager: Arc::clone(&manager),
        stop: Arc::clone(&stop),
        events: events_tx,
    };

    let mut active: BTreeSet<String> =
        WORKER_IDS.iter().map(|id| id.to_string()).collect();
    let handles = vec![
        thread::spawn({
            let ctx = ctx.clone();
            move || admission_worker::run_admission_loop("admission".to_string(), ctx)
        }),
        thread::spawn({
            let ctx = ctx.clone();
            move || ipc_worker::run_ipc_loop("ipc".to_string(), ctx)
        }),
        thread::spawn({
            let ctx = ctx.clone();
            move || scheduler_worker::run_scheduler_loop("scheduler".to_string(), ctx)
        }),
    ];
    drop(ctx);

    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            append_runtime_log(&paths, "info", "supervisor.stop.signal", "stop file detected");
        }

        match events_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => handle_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Sessions drain first so their monitors can checkpoint; workers wind
    // down in parallel via the shared stop flag.
    let grace = shutdown_wait_timeout();
    let still_alive = manager.shutdown(grace);
    if still_alive > 0 {
        append_runtime_log(
            &paths,
            "warn",
            "supervisor.sessions.grace_exceeded",
            &format!("{still_alive} sessions still terminating"),
        );
    }

    let deadline = std::time::Instant::now() + grace;
    while !active.is_empty() && std::time::Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(event) => handle_worker_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        let message = format!(
            "shutdown timeout waiting for workers: {}",
            active.iter().cloned().collect::<Vec<_>>().join(",")
        );
        state.last_error = Some(message.clone());
        for worker_id in &active {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.state = WorkerState::Error;
                worker.last_error = Some("shutdown timeout".to_string());
            }
        }
        append_runtime_log(&paths, "warn", "supervisor.shutdown.timeout", &message);
    }

    for handle in handles {
        let _ = handle.join();
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(&paths, &state)?;

    ownership_lock::clear_start_lock(&paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(&paths, "info", "supervisor.stopped", "host stopped cleanly");
    Ok(())
}

fn shutdown_wait_timeout() -> Duration {
    if let Some(milliseconds) = std::env::var("WARDEND_SHUTDOWN_TIMEOUT_MILLISECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
    {
        return Duration::from_millis(milliseconds);
    }
    let seconds = std::env::var("WARDEND_SHUTDOWN_TIMEOUT_SECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5);
    Duration::from_secs(seconds)
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

fn handle_worker_event(
    paths: &StatePaths,
    state: &mut SupervisorState,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) {
    if let Some(log) = apply_worker_event(&mut state.workers, active, event) {
        append_runtime_log(paths, log.level, log.event, &log.message);
    }

    let _ = save_supervisor_state(paths, state);
}
