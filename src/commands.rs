use crate::channels::submit_inbound;
use crate::config::Settings;
use crate::queue::QueuePaths;
use crate::runtime::{
    append_runtime_log, bootstrap_state_root, cleanup_stale_host, clear_start_lock,
    default_state_root_path, host_ownership_state, load_supervisor_state, reserve_start_lock,
    run_supervisor, save_supervisor_state, spawn_host_process, stop_active_host,
    write_host_lock_pid, OwnershipState, RuntimeError, StatePaths,
};
use crate::shared::ids::GroupId;
use crate::shared::time::now_secs;
use crate::store::HostStore;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match args[0].as_str() {
        "start" => cmd_start(),
        "stop" => cmd_stop(),
        "restart" => cmd_restart(),
        "status" => cmd_status(),
        "logs" => cmd_logs(),
        "enqueue" => cmd_enqueue(&args[1..]),
        "__supervisor" => cmd_supervisor(&args[1..]),
        "help" | "--help" | "-h" => Ok(help_text()),
        other => Err(format!("unknown command `{other}`")),
    }
}

pub fn help_text() -> String {
    [
        "Commands:",
        "  start                      Start the wardend host and workers",
        "  stop                       Stop the active host",
        "  restart                    Restart the host and workers",
        "  status                     Show host ownership/health status",
        "  logs                       Print recent runtime and security log lines",
        "  enqueue <group> <message>  Queue an inbound wake for a group",
    ]
    .join("\n")
}

fn state_root() -> Result<PathBuf, String> {
    if let Some(root) = std::env::var_os("WARDEND_STATE_ROOT") {
        return Ok(PathBuf::from(root));
    }
    default_state_root_path().map_err(|e| e.to_string())
}

fn ensure_state_root() -> Result<StatePaths, String> {
    let paths = StatePaths::new(state_root()?);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    Ok(paths)
}

fn load_settings(paths: &StatePaths) -> Result<Settings, String> {
    Settings::load(&paths.settings_file()).map_err(|e| e.to_string())
}

pub fn cmd_start() -> Result<String, String> {
    let paths = ensure_state_root()?;
    load_settings(&paths)?;
    match host_ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => {
            return Err(RuntimeError::AlreadyRunning { pid }.to_string())
        }
        OwnershipState::Stale => cleanup_stale_host(&paths).map_err(|e| e.to_string())?,
        OwnershipState::NotRunning => {}
    }

    reserve_start_lock(&paths).map_err(|e| e.to_string())?;
    let pid = match spawn_host_process(&paths.root).and_then(|pid| {
        write_host_lock_pid(&paths, pid)?;
        Ok(pid)
    }) {
        Ok(pid) => pid,
        Err(err) => {
            clear_start_lock(&paths);
            return Err(err.to_string());
        }
    };

    append_runtime_log(
        &paths,
        "info",
        "host.start.requested",
        &format!("pid={pid}"),
    );
    Ok(format!(
        "started\nstate_root={}\npid={}",
        paths.root.display(),
        pid
    ))
}

pub fn cmd_stop() -> Result<String, String> {
    let paths = ensure_state_root()?;
    match stop_active_host(&paths, Duration::from_secs(5)) {
        Ok(result) => Ok(format!(
            "stopped\npid={}\nforced={}",
            result.pid, result.forced
        )),
        Err(RuntimeError::NotRunning) => Ok("stopped\nrunning=false".to_string()),
        Err(err) => Err(err.to_string()),
    }
}

pub fn cmd_restart() -> Result<String, String> {
    let stop = cmd_stop()?;
    let start = cmd_start()?;
    Ok(format!("restart complete\n{stop}\n{start}"))
}

pub fn cmd_status() -> Result<String, String> {
    let paths = ensure_state_root()?;
    let mut state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
    let mut ownership = "not_running".to_string();
    match host_ownership_state(&paths).map_err(|e| e.to_string())? {
        OwnershipState::Running { pid } => {
            ownership = "running".to_string();
            if !state.running || state.pid != Some(pid) {
                state.running = true;
                state.pid = Some(pid);
                if state.started_at.is_none() {
                    state.started_at = Some(now_secs());
                }
                state.stopped_at = None;
                save_supervisor_state(&paths, &state).map_err(|e| e.to_string())?;
            }
        }
        OwnershipState::Stale => {
            ownership = "stale".to_string();
            cleanup_stale_host(&paths).map_err(|e| e.to_string())?;
            state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
        }
        OwnershipState::NotRunning => {
            if state.running || state.pid.is_some() {
                cleanup_stale_host(&paths).map_err(|e| e.to_string())?;
                state = load_supervisor_state(&paths).map_err(|e| e.to_string())?;
            }
        }
    }

    let mut lines = Vec::new();
    lines.push(format!("ownership={ownership}"));
    lines.push(format!("running={}", state.running));
    lines.push(format!("pid={}", render_opt(state.pid)));
    lines.push(format!("started_at={}", render_opt(state.started_at)));
    lines.push(format!("stopped_at={}", render_opt(state.stopped_at)));
    lines.push(format!(
        "last_error={}",
        state.last_error.clone().unwrap_or_else(|| "none".to_string())
    ));
    for (id, worker) in &state.workers {
        lines.push(format!("worker:{id}.state={:?}", worker.state).to_lowercase());
        lines.push(format!(
            "worker:{id}.last_heartbeat={}",
            render_opt(worker.last_heartbeat_at)
        ));
        lines.push(format!(
            "worker:{id}.last_error={}",
            worker.last_error.clone().unwrap_or_else(|| "none".to_string())
        ));
    }
    Ok(lines.join("\n"))
}

pub fn cmd_logs() -> Result<String, String> {
    let paths = ensure_state_root()?;
    let mut entries = vec![paths.runtime_log_path(), paths.security_log_path()];
    entries.retain(|path| path.is_file());
    if entries.is_empty() {
        return Ok("no logs".to_string());
    }

    let mut out = Vec::new();
    for path in entries {
        let raw = fs::read_to_string(&path).unwrap_or_default();
        let mut recent = raw.lines().rev().take(10).collect::<Vec<_>>();
        recent.reverse();
        for line in recent {
            out.push(format!("{}: {}", path.display(), line));
        }
    }
    Ok(out.join("\n"))
}

pub fn cmd_enqueue(args: &[String]) -> Result<String, String> {
    if args.len() < 2 {
        return Err("usage: enqueue <group> <message>".to_string());
    }
    let group_id = GroupId::parse(&args[0])?;
    let message = args[1..].join(" ");

    let paths = ensure_state_root()?;
    let store = HostStore::open(&paths.store_db_path()).map_err(|e| e.to_string())?;
    let queue = QueuePaths::from_state_root(&paths.root);
    queue.bootstrap().map_err(|e| e.to_string())?;
    let wake = submit_inbound(&store, &queue, group_id.as_str(), "cli", &message, now_secs())
        .map_err(|e| e.to_string())?;
    Ok(format!("queued\nwake_id={}\ngroup={}", wake.wake_id, group_id))
}

pub fn cmd_supervisor(args: &[String]) -> Result<String, String> {
    let state_root = parse_supervisor_state_root(args)?;
    let paths = StatePaths::new(&state_root);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    let settings = Settings::load(&paths.settings_file()).map_err(|e| e.to_string())?;
    run_supervisor(&state_root, settings).map_err(|e| e.to_string())?;
    Ok("host exited".to_string())
}

fn parse_supervisor_state_root(args: &[String]) -> Result<PathBuf, String> {
    if args.len() == 2 && args[0] == "--state-root" {
        return Ok(PathBuf::from(&args[1]));
    }
    Err("usage: __supervisor --state-root <path>".to_string())
}

fn render_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_is_rejected() {
        let err = run_cli(vec!["frobnicate".to_string()]).expect_err("must fail");
        assert!(err.contains("unknown command"));
    }

    #[test]
    fn empty_invocation_prints_help() {
        let output = run_cli(Vec::new()).expect("help");
        assert!(output.contains("enqueue <group> <message>"));
    }

    #[test]
    fn supervisor_verb_requires_state_root_flag() {
        let err = parse_supervisor_state_root(&[]).expect_err("must fail");
        assert_eq!(err, "usage: __supervisor --state-root <path>");
        let root = parse_supervisor_state_root(&[
            "--state-root".to_string(),
            "/tmp/wardend-state".to_string(),
        ])
        .expect("parsed");
        assert_eq!(root, PathBuf::from("/tmp/wardend-state"));
    }
}
