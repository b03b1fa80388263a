use super::{ExitReason, SessionControl, SessionError};
use crate::config::Limits;
use crate::shared::time::now_millis;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MONITOR_POLL: Duration = Duration::from_millis(25);

// How long a stopping agent gets to exit on its own after TERM.
const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
}

pub fn spawn_agent(spec: &SpawnSpec) -> Result<Child, SessionError> {
    let mut command = Command::new(&spec.binary);
    command
        .current_dir(&spec.cwd)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.spawn().map_err(|source| SessionError::Spawn {
        binary: spec.binary.clone(),
        source,
    })
}

/// Drive one session process to completion: drain its output, enforce the
/// idle and hard timers and the output cap, honor stop requests. Blocks the
/// calling (monitor) thread until the process is gone and returns the exit
/// reason.
pub fn monitor_child(
    mut child: Child,
    spec: &SpawnSpec,
    control: &Arc<SessionControl>,
    limits: &Limits,
) -> ExitReason {
    let stdout_reader = child.stdout.take().map(|stdout| {
        let control = Arc::clone(control);
        let log_path = spec.log_path.clone();
        let cap = limits.output_cap_bytes;
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if control.note_output(line.len() as u64 + 1, now_millis(), cap) {
                    append_log_line(&log_path, &line);
                }
            }
        })
    });
    let stderr_reader = child.stderr.take().map(|stderr| {
        let log_path = spec.log_path.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                append_log_line(&log_path, &format!("stderr: {line}"));
            }
        })
    });

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if control.stop_reason().is_some() {
            break terminate_child(&mut child);
        }
        if let Some(reason) = control.timer_verdict(now_millis(), limits) {
            control.request_stop(reason);
            continue;
        }
        thread::sleep(MONITOR_POLL);
    };

    if let Some(reader) = stdout_reader {
        let _ = reader.join();
    }
    if let Some(reader) = stderr_reader {
        let _ = reader.join();
    }

    if let Some(reason) = control.stop_reason() {
        return reason;
    }
    match status {
        Some(status) if status.success() => ExitReason::GracefulExit,
        _ => ExitReason::Crashed,
    }
}

/// Stop the agent process: TERM first so it can flush state and exit on its
/// own terms, KILL only if it is still alive at the grace deadline.
fn terminate_child(child: &mut Child) -> Option<ExitStatus> {
    send_term(child.id());
    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(MONITOR_POLL),
            Err(_) => return None,
        }
    }
    let _ = child.kill();
    child.wait().ok()
}

#[cfg(unix)]
fn send_term(pid: u32) {
    let _ = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

fn append_log_line(log_path: &Path, line: &str) {
    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        let _ = writeln!(file, "{line}");
    }
}
