use crate::channels::{write_outbound, OutboundKind};
use crate::config::{Limits, Settings};
use crate::ipc::{write_input, InputMessage, IpcError, SessionMailbox};
use crate::mounts::{
    load_allowlist, validate_mount_set, AllowlistError, ApprovedMount, MountDenial,
};
use crate::queue::WakeRequest;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::new_compact_id;
use crate::shared::time::{now_millis, now_secs};
use crate::store::{HostStore, SessionCheckpoint, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

mod process;

pub use process::{monitor_child, SpawnSpec};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Mount(#[from] MountDenial),
    #[error(transparent)]
    Allowlist(#[from] AllowlistError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn agent runtime `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build session id: {0}")]
    SessionId(String),
}

/// Why a session stopped. Recorded in the checkpoint row verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    GracefulExit,
    IdleTimeout,
    HardTimeout,
    OutputCap,
    Shutdown,
    Crashed,
    SpawnFailed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GracefulExit => "graceful_exit",
            Self::IdleTimeout => "idle_timeout",
            Self::HardTimeout => "hard_timeout",
            Self::OutputCap => "output_cap",
            Self::Shutdown => "shutdown",
            Self::Crashed => "crashed",
            Self::SpawnFailed => "spawn_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    Draining(ExitReason),
    Terminated(ExitReason),
    Failed,
}

/// Shared mutable surface between the admission path, the monitor thread and
/// the output reader threads.
#[derive(Debug)]
pub struct SessionControl {
    started_ms: i64,
    state: Mutex<SessionState>,
    last_activity_ms: AtomicI64,
    output_bytes: AtomicU64,
    cap_breached: AtomicBool,
    last_wake_id: Mutex<Option<String>>,
}

impl SessionControl {
    pub fn new(now_ms: i64) -> Self {
        Self {
            started_ms: now_ms,
            state: Mutex::new(SessionState::Pending),
            last_activity_ms: AtomicI64::new(now_ms),
            output_bytes: AtomicU64::new(0),
            cap_breached: AtomicBool::new(false),
            last_wake_id: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    /// Activity resets the idle window. Both agent output and IPC deliveries
    /// count.
    pub fn touch(&self, now_ms: i64) {
        self.last_activity_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn note_delivery(&self, wake_id: &str, now_ms: i64) {
        self.touch(now_ms);
        *lock(&self.last_wake_id) = Some(wake_id.to_string());
    }

    pub fn last_wake_id(&self) -> Option<String> {
        lock(&self.last_wake_id).clone()
    }

    /// Ask the session to stop. The first reason wins; later requests are
    /// no-ops so the recorded cause is the original one.
    pub fn request_stop(&self, reason: ExitReason) {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Pending
            | SessionState::Starting
            | SessionState::Running => *state = SessionState::Draining(reason),
            SessionState::Draining(_) | SessionState::Terminated(_) | SessionState::Failed => {}
        }
    }

    pub fn stop_reason(&self) -> Option<ExitReason> {
        match self.state() {
            SessionState::Draining(reason) | SessionState::Terminated(reason) => Some(reason),
            _ => None,
        }
    }

    /// Account one stdout line against the output cap. Returns false once
    /// the cap is breached; from then on output is discarded.
    pub fn note_output(&self, bytes: u64, now_ms: i64, cap_bytes: u64) -> bool {
        if self.cap_breached.load(Ordering::SeqCst) {
            return false;
        }
        let total = self.output_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > cap_bytes {
            self.cap_breached.store(true, Ordering::SeqCst);
            self.request_stop(ExitReason::OutputCap);
            return false;
        }
        self.touch(now_ms);
        true
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::SeqCst)
    }

    /// Independent timers: the hard deadline runs from start regardless of
    /// activity, the idle window from the last activity.
    pub fn timer_verdict(&self, now_ms: i64, limits: &Limits) -> Option<ExitReason> {
        if now_ms - self.started_ms > limits.hard_timeout_ms as i64 {
            return Some(ExitReason::HardTimeout);
        }
        let idle_for = now_ms - self.last_activity_ms.load(Ordering::SeqCst);
        if idle_for > limits.idle_timeout_ms as i64 {
            return Some(ExitReason::IdleTimeout);
        }
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of presenting one wake to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// An existing live session received the wake through its input mailbox.
    Delivered { session_id: String },
    /// A fresh session was spawned with the wake as its first input.
    Spawned { session_id: String },
    /// The group's session is draining; retry once it has terminated.
    Busy,
    /// The global session cap is reached; retry when a slot frees up.
    Capacity,
}

struct LiveSession {
    session_id: String,
    control: Arc<SessionControl>,
    mailbox: SessionMailbox,
}

/// One entry per group holding a slot in the live map. A reservation is
/// placed under the lock before the (slow) spawn runs, so a concurrent wake
/// for the same group can never start a second spawn.
enum SessionSlot {
    Reserved,
    Live(LiveSession),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MountManifestEntry {
    host_path: PathBuf,
    container_path: String,
    read_write: bool,
}

/// Owns every live session. Enforces at most one session per group and at
/// most `limits.max_concurrent_sessions` overall.
pub struct SessionManager {
    settings: Settings,
    store: HostStore,
    state_root: PathBuf,
    live: Arc<Mutex<HashMap<String, SessionSlot>>>,
}

impl SessionManager {
    pub fn new(settings: Settings, store: HostStore, state_root: &Path) -> Self {
        Self {
            settings,
            store,
            state_root: state_root.to_path_buf(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_live(&self, group_id: &str) -> bool {
        lock(&self.live).contains_key(group_id)
    }

    pub fn session_state(&self, group_id: &str) -> Option<SessionState> {
        lock(&self.live).get(group_id).and_then(|slot| match slot {
            SessionSlot::Live(session) => Some(session.control.state()),
            SessionSlot::Reserved => None,
        })
    }

    /// Route one claimed wake. Deliver into the live session when there is
    /// one, spawn otherwise; never exceed the global cap.
    pub fn admit_wake(
        &self,
        group: &crate::store::GroupRecord,
        wake: &WakeRequest,
    ) -> Result<Admission, SessionError> {
        {
            let mut live = lock(&self.live);
            match live.get(&group.group_id) {
                Some(SessionSlot::Live(session)) => {
                    return Ok(self.deliver_into(session, wake))
                }
                Some(SessionSlot::Reserved) => return Ok(Admission::Busy),
                None => {}
            }
            if live.len() >= self.settings.limits.max_concurrent_sessions {
                return Ok(Admission::Capacity);
            }
            live.insert(group.group_id.clone(), SessionSlot::Reserved);
        }
        match self.spawn_session(group, wake) {
            Ok(session_id) => Ok(Admission::Spawned { session_id }),
            Err(err) => {
                lock(&self.live).remove(&group.group_id);
                Err(err)
            }
        }
    }

    fn deliver_into(&self, session: &LiveSession, wake: &WakeRequest) -> Admission {
        match session.control.state() {
            SessionState::Starting | SessionState::Running => {}
            _ => return Admission::Busy,
        }
        let input = InputMessage {
            wake_id: wake.wake_id.clone(),
            reason: wake.reason.clone(),
            message: wake.message.clone(),
            sender: wake.sender.clone(),
            delivered_at: now_secs(),
        };
        match write_input(&session.mailbox, &input) {
            Ok(_) => {
                session.control.note_delivery(&wake.wake_id, now_millis());
                Admission::Delivered {
                    session_id: session.session_id.clone(),
                }
            }
            Err(_) => {
                // The mailbox is gone from under the session; drain it so
                // the next pass spawns fresh.
                session.control.request_stop(ExitReason::Crashed);
                Admission::Busy
            }
        }
    }

    fn spawn_session(
        &self,
        group: &crate::store::GroupRecord,
        wake: &WakeRequest,
    ) -> Result<String, SessionError> {
        // The allowlist is re-read on every spawn so edits apply without a
        // restart, and the full mount set must pass before anything starts.
        let allowlist = load_allowlist(&self.settings.allowlist_path)?;
        let is_main = group.group_id == self.settings.main_group_id;
        let approved = validate_mount_set(
            &group.mounts,
            &allowlist,
            &self.settings.allowlist_path,
            is_main,
        )?;

        let workspace = self.settings.group_workspace(&group.workspace_folder);
        materialize_workspace(&workspace, &approved)?;

        let mailbox = SessionMailbox::for_group(&self.state_root, &group.group_id);
        mailbox.bootstrap()?;

        let now_ms = now_millis();
        let session_id = new_compact_id("sess", now_secs()).map_err(SessionError::SessionId)?;
        let control = Arc::new(SessionControl::new(now_ms));
        control.set_state(SessionState::Starting);

        write_input(
            &mailbox,
            &InputMessage {
                wake_id: wake.wake_id.clone(),
                reason: wake.reason.clone(),
                message: wake.message.clone(),
                sender: wake.sender.clone(),
                delivered_at: now_secs(),
            },
        )?;
        control.note_delivery(&wake.wake_id, now_ms);

        let log_path = self
            .state_root
            .join("sessions")
            .join(crate::shared::ids::group_dir_name(&group.group_id))
            .join("logs/session.log");
        let spec = SpawnSpec {
            binary: self.settings.agent_runtime.binary.clone(),
            args: self.settings.agent_runtime.args.clone(),
            env: self.build_env(group, &session_id, &mailbox, &workspace),
            cwd: workspace.clone(),
            log_path,
        };

        let child = match process::spawn_agent(&spec) {
            Ok(child) => child,
            Err(err) => {
                self.checkpoint(&group.group_id, &control, ExitReason::SpawnFailed);
                control.set_state(SessionState::Failed);
                return Err(err);
            }
        };
        control.set_state(SessionState::Running);

        lock(&self.live).insert(
            group.group_id.clone(),
            SessionSlot::Live(LiveSession {
                session_id: session_id.clone(),
                control: Arc::clone(&control),
                mailbox,
            }),
        );

        let live = Arc::clone(&self.live);
        let store = self.store.clone();
        let state_root = self.state_root.clone();
        let limits = self.settings.limits;
        let group_id = group.group_id.clone();
        let monitor_control = Arc::clone(&control);
        let monitor_spec = spec;
        thread::spawn(move || {
            let reason = monitor_child(child, &monitor_spec, &monitor_control, &limits);
            monitor_control.set_state(SessionState::Terminated(reason));

            let checkpoint = SessionCheckpoint {
                group_id: group_id.clone(),
                last_wake_id: monitor_control.last_wake_id(),
                continuity_marker: read_continuity_marker(&monitor_spec.cwd),
                exit_reason: reason.as_str().to_string(),
                terminated_at: now_secs(),
            };
            let _ = store.save_checkpoint(&checkpoint);

            // A crash is user-visible as a notice, never host-fatal.
            if reason == ExitReason::Crashed {
                let _ = write_outbound(
                    &state_root,
                    &group_id,
                    OutboundKind::CrashNotice,
                    "Something went wrong in your assistant session; it has been restarted. \
                     Your last message may need to be re-sent.",
                    now_secs(),
                );
            }

            lock(&live).remove(&group_id);
        });

        Ok(session_id)
    }

    fn build_env(
        &self,
        group: &crate::store::GroupRecord,
        session_id: &str,
        mailbox: &SessionMailbox,
        workspace: &Path,
    ) -> std::collections::BTreeMap<String, String> {
        let mut env = self.settings.agent_runtime.env.clone();
        env.insert("WARDEND_GROUP_ID".to_string(), group.group_id.clone());
        env.insert("WARDEND_SESSION_ID".to_string(), session_id.to_string());
        env.insert(
            "WARDEND_INPUT_DIR".to_string(),
            mailbox.input.display().to_string(),
        );
        env.insert(
            "WARDEND_OUTPUT_DIR".to_string(),
            mailbox.output.display().to_string(),
        );
        env.insert(
            "WARDEND_WORKSPACE".to_string(),
            workspace.display().to_string(),
        );
        env
    }

    fn checkpoint(&self, group_id: &str, control: &SessionControl, reason: ExitReason) {
        let _ = self.store.save_checkpoint(&SessionCheckpoint {
            group_id: group_id.to_string(),
            last_wake_id: control.last_wake_id(),
            continuity_marker: None,
            exit_reason: reason.as_str().to_string(),
            terminated_at: now_secs(),
        });
    }

    /// Ask every live session to drain and wait up to the grace period for
    /// the monitors to finish. Idempotent. Returns the number of sessions
    /// still alive when the grace period ran out.
    pub fn shutdown(&self, grace: Duration) -> usize {
        let controls: Vec<Arc<SessionControl>> = lock(&self.live)
            .values()
            .filter_map(|slot| match slot {
                SessionSlot::Live(session) => Some(Arc::clone(&session.control)),
                SessionSlot::Reserved => None,
            })
            .collect();
        for control in controls {
            control.request_stop(ExitReason::Shutdown);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if lock(&self.live).is_empty() {
                return 0;
            }
            thread::sleep(Duration::from_millis(20));
        }
        lock(&self.live).len()
    }
}

/// Build the session workspace: symlink every approved mount under it at
/// its container path and record the grants in `mounts.json`.
fn materialize_workspace(
    workspace: &Path,
    approved: &[ApprovedMount],
) -> Result<(), SessionError> {
    fs::create_dir_all(workspace).map_err(|e| io_err(workspace, e))?;

    let mut manifest = Vec::with_capacity(approved.len());
    for mount in approved {
        let rel = mount.container_path.trim_start_matches('/');
        if rel.is_empty() {
            continue;
        }
        let link = workspace.join(rel);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        match fs::symlink_metadata(&link) {
            Ok(_) => fs::remove_file(&link).map_err(|e| io_err(&link, e))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&link, err)),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&mount.host_path, &link).map_err(|e| io_err(&link, e))?;

        manifest.push(MountManifestEntry {
            host_path: mount.host_path.clone(),
            container_path: mount.container_path.clone(),
            read_write: mount.read_write,
        });
    }

    let manifest_path = workspace.join("mounts.json");
    atomic_write_json(&manifest_path, &manifest).map_err(|e| io_err(&manifest_path, e))?;
    Ok(())
}

/// Sessions may leave a short marker in their workspace for the next session
/// of the same group to pick up.
fn read_continuity_marker(workspace: &Path) -> Option<String> {
    let raw = fs::read_to_string(workspace.join(".continuity")).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(idle_ms: u64, hard_ms: u64, cap: u64) -> Limits {
        Limits {
            max_concurrent_sessions: 4,
            idle_timeout_ms: idle_ms,
            hard_timeout_ms: hard_ms,
            output_cap_bytes: cap,
        }
    }

    #[test]
    fn idle_window_expires_just_past_the_boundary() {
        let control = SessionControl::new(1_000);
        let limits = limits(5_000, 60_000, 1_000_000);

        assert_eq!(control.timer_verdict(6_000, &limits), None);
        assert_eq!(
            control.timer_verdict(6_001, &limits),
            Some(ExitReason::IdleTimeout)
        );

        control.touch(6_000);
        assert_eq!(control.timer_verdict(11_000, &limits), None);
        assert_eq!(
            control.timer_verdict(11_001, &limits),
            Some(ExitReason::IdleTimeout)
        );
    }

    #[test]
    fn hard_deadline_ignores_activity() {
        let control = SessionControl::new(1_000);
        let limits = limits(5_000, 10_000, 1_000_000);
        control.touch(10_999);
        assert_eq!(
            control.timer_verdict(11_001, &limits),
            Some(ExitReason::HardTimeout)
        );
    }

    #[test]
    fn output_cap_requests_stop_and_discards() {
        let control = SessionControl::new(0);
        control.set_state(SessionState::Running);
        assert!(control.note_output(60, 10, 100));
        assert!(!control.note_output(60, 20, 100));
        assert_eq!(control.stop_reason(), Some(ExitReason::OutputCap));
        // Further output is discarded without growing the count.
        assert!(!control.note_output(60, 30, 100));
    }

    #[test]
    fn first_stop_reason_wins() {
        let control = SessionControl::new(0);
        control.set_state(SessionState::Running);
        control.request_stop(ExitReason::IdleTimeout);
        control.request_stop(ExitReason::Shutdown);
        assert_eq!(control.stop_reason(), Some(ExitReason::IdleTimeout));
        assert!(matches!(
            control.state(),
            SessionState::Draining(ExitReason::IdleTimeout)
        ));
    }

    #[test]
    fn exit_reasons_serialize_to_stable_names() {
        assert_eq!(ExitReason::GracefulExit.as_str(), "graceful_exit");
        assert_eq!(ExitReason::IdleTimeout.as_str(), "idle_timeout");
        assert_eq!(ExitReason::OutputCap.as_str(), "output_cap");
        assert_eq!(ExitReason::SpawnFailed.as_str(), "spawn_failed");
    }
}
