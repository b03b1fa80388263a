use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
        at: i64,
    },
    Heartbeat {
        worker_id: String,
        at: i64,
    },
    Error {
        worker_id: String,
        at: i64,
        message: String,
        fatal: bool,
    },
    Stopped {
        worker_id: String,
        at: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self {
            state: WorkerState::Stopped,
            started_at: None,
            stopped_at: None,
            last_heartbeat_at: None,
            last_error: None,
        }
    }
}

pub struct WorkerLog {
    pub level: &'static str,
    pub event: &'static str,
    pub message: String,
}

/// Fold one worker event into the health table. Returns a log entry for
/// state transitions; heartbeats are tracked silently.
pub fn apply_worker_event(
    workers: &mut BTreeMap<String, WorkerHealth>,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) -> Option<WorkerLog> {
    match event {
        WorkerEvent::Started { worker_id, at } => {
            let health = workers.entry(worker_id.clone()).or_default();
            health.state = WorkerState::Running;
            health.started_at = Some(at);
            health.stopped_at = None;
            Some(WorkerLog {
                level: "info",
                event: "worker.started",
                message: worker_id,
            })
        }
        WorkerEvent::Heartbeat { worker_id, at } => {
            if let Some(health) = workers.get_mut(&worker_id) {
                health.last_heartbeat_at = Some(at);
            }
            None
        }
        WorkerEvent::Error {
            worker_id,
            at,
            message,
            fatal,
        } => {
            let health = workers.entry(worker_id.clone()).or_default();
            health.last_error = Some(message.clone());
            if fatal {
                health.state = WorkerState::Error;
                health.stopped_at = Some(at);
                active.remove(&worker_id);
            }
            Some(WorkerLog {
                level: if fatal { "error" } else { "warn" },
                event: if fatal {
                    "worker.failed"
                } else {
                    "worker.error"
                },
                message: format!("{worker_id}: {message}"),
            })
        }
        WorkerEvent::Stopped { worker_id, at } => {
            let health = workers.entry(worker_id.clone()).or_default();
            if health.state != WorkerState::Error {
                health.state = WorkerState::Stopped;
            }
            health.stopped_at = Some(at);
            active.remove(&worker_id);
            Some(WorkerLog {
                level: "info",
                event: "worker.stopped",
                message: worker_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_track_health() {
        let mut workers = BTreeMap::new();
        let mut active = BTreeSet::from(["admission".to_string()]);

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Started {
                worker_id: "admission".to_string(),
                at: 10,
            },
        );
        assert_eq!(workers["admission"].state, WorkerState::Running);

        let quiet = apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Heartbeat {
                worker_id: "admission".to_string(),
                at: 20,
            },
        );
        assert!(quiet.is_none());
        assert_eq!(workers["admission"].last_heartbeat_at, Some(20));

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Error {
                worker_id: "admission".to_string(),
                at: 30,
                message: "disk full".to_string(),
                fatal: false,
            },
        );
        assert_eq!(workers["admission"].state, WorkerState::Running);
        assert!(active.contains("admission"));

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Stopped {
                worker_id: "admission".to_string(),
                at: 40,
            },
        );
        assert_eq!(workers["admission"].state, WorkerState::Stopped);
        assert!(active.is_empty());
    }

    #[test]
    fn fatal_error_removes_worker_from_active_set() {
        let mut workers = BTreeMap::new();
        let mut active = BTreeSet::from(["ipc".to_string()]);

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Error {
                worker_id: "ipc".to_string(),
                at: 5,
                message: "boom".to_string(),
                fatal: true,
            },
        );
        assert_eq!(workers["ipc"].state, WorkerState::Error);
        assert!(active.is_empty());
    }
}
