use super::worker_registry::WorkerEvent;
use super::state_paths::StatePaths;
use crate::config::Settings;
use crate::session::SessionManager;
use crate::store::HostStore;
use crate::shared::time::now_secs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(crate) const ADMISSION_POLL: Duration = Duration::from_millis(200);
pub(crate) const IPC_POLL: Duration = Duration::from_millis(500);

/// Everything a worker loop needs, cloned per thread.
#[derive(Clone)]
pub struct WorkerRunContext {
    pub paths: StatePaths,
    pub settings: Settings,
    pub store: HostStore,
    pub manager: Arc<SessionManager>,
    pub stop: Arc<AtomicBool>,
    pub events: Sender<WorkerEvent>,
}

impl WorkerRunContext {
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn emit_started(&self, worker_id: &str) {
        let _ = self.events.send(WorkerEvent::Started {
            worker_id: worker_id.to_string(),
            at: now_secs(),
        });
    }

    pub fn emit_heartbeat(&self, worker_id: &str) {
        let _ = self.events.send(WorkerEvent::Heartbeat {
            worker_id: worker_id.to_string(),
            at: now_secs(),
        });
    }

    pub fn emit_error(&self, worker_id: &str, message: &str, fatal: bool) {
        let _ = self.events.send(WorkerEvent::Error {
            worker_id: worker_id.to_string(),
            at: now_secs(),
            message: message.to_string(),
            fatal,
        });
    }

    pub fn emit_stopped(&self, worker_id: &str) {
        let _ = self.events.send(WorkerEvent::Stopped {
            worker_id: worker_id.to_string(),
            at: now_secs(),
        });
    }
}

/// Sleep in small steps so a stop request is honored within ~200ms. Returns
/// false if stop was requested during the wait.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(200));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
