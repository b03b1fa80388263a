use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::{new_compact_id, sanitize_filename_component};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid wake payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build wake id: {0}")]
    WakeId(String),
}

/// Why a group is being woken. Channel adapters enqueue `inbound`; the
/// scheduler enqueues `scheduled`/`heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WakeReason {
    Inbound,
    Scheduled { task_id: String },
    Heartbeat { task_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeRequest {
    pub wake_id: String,
    pub group_id: String,
    pub reason: WakeReason,
    pub message: String,
    #[serde(default)]
    pub sender: Option<String>,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub incoming: PathBuf,
    pub processing: PathBuf,
}

impl QueuePaths {
    pub fn from_state_root(state_root: &Path) -> Self {
        Self {
            incoming: state_root.join("queue/incoming"),
            processing: state_root.join("queue/processing"),
        }
    }

    pub fn bootstrap(&self) -> Result<(), QueueError> {
        for dir in [&self.incoming, &self.processing] {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        Ok(())
    }
}

/// Non-blocking enqueue: write one wake file and return. Admission happens
/// asynchronously in the admission worker.
pub fn enqueue_wake(
    paths: &QueuePaths,
    group_id: &str,
    reason: WakeReason,
    message: &str,
    sender: Option<&str>,
    now: i64,
) -> Result<WakeRequest, QueueError> {
    fs::create_dir_all(&paths.incoming).map_err(|e| io_err(&paths.incoming, e))?;
    let wake_id = new_compact_id("wake", now).map_err(QueueError::WakeId)?;
    let wake = WakeRequest {
        wake_id: wake_id.clone(),
        group_id: group_id.to_string(),
        reason,
        message: message.to_string(),
        sender: sender.map(str::to_string),
        enqueued_at: now,
    };
    let path = paths
        .incoming
        .join(format!("{}.json", sanitize_filename_component(&wake_id)));
    atomic_write_json(&path, &wake).map_err(|e| io_err(&path, e))?;
    Ok(wake)
}

#[derive(Debug, Clone)]
pub struct ClaimedWake {
    pub processing_path: PathBuf,
    pub payload: WakeRequest,
}

fn sorted_incoming_paths(incoming_dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(incoming_dir).map_err(|e| io_err(incoming_dir, e))? {
        let entry = entry.map_err(|e| io_err(incoming_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| io_err(&path, e))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

/// Claim the oldest wake by renaming it into `processing`. The rename is the
/// atomic claim; a concurrent claimer loses the race and moves on.
pub fn claim_oldest(paths: &QueuePaths) -> Result<Option<ClaimedWake>, QueueError> {
    for incoming_path in sorted_incoming_paths(&paths.incoming)? {
        let Some(file_name) = incoming_path.file_name() else {
            continue;
        };
        let processing_path = paths.processing.join(file_name);

        match fs::rename(&incoming_path, &processing_path) {
            Ok(_) => {
                let raw = match fs::read_to_string(&processing_path) {
                    Ok(raw) => raw,
                    Err(err) => {
                        requeue_processing_file(paths, &processing_path)?;
                        return Err(io_err(&processing_path, err));
                    }
                };
                let payload: WakeRequest = match serde_json::from_str(&raw) {
                    Ok(payload) => payload,
                    Err(err) => {
                        requeue_processing_file(paths, &processing_path)?;
                        return Err(parse_err(&processing_path, err));
                    }
                };
                return Ok(Some(ClaimedWake {
                    processing_path,
                    payload,
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&incoming_path, err)),
        }
    }
    Ok(None)
}

pub fn complete_wake(claimed: &ClaimedWake) -> Result<(), QueueError> {
    fs::remove_file(&claimed.processing_path).map_err(|e| io_err(&claimed.processing_path, e))
}

pub fn requeue_failure(paths: &QueuePaths, claimed: &ClaimedWake) -> Result<PathBuf, QueueError> {
    requeue_processing_file(paths, &claimed.processing_path)
}

fn requeue_processing_file(
    paths: &QueuePaths,
    processing_path: &Path,
) -> Result<PathBuf, QueueError> {
    let name = processing_path
        .file_name()
        .and_then(|v| v.to_str())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("wake.json");
    let incoming = paths.incoming.join(recovered_filename(0, name));
    fs::rename(processing_path, &incoming).map_err(|e| io_err(processing_path, e))?;
    Ok(incoming)
}

/// Move orphaned processing files back to incoming after a crash. Digest in
/// the new name keeps recovered names collision free.
pub fn recover_processing_entries(paths: &QueuePaths) -> Result<Vec<PathBuf>, QueueError> {
    let mut recovered = Vec::new();
    if !paths.processing.exists() {
        return Ok(recovered);
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(&paths.processing).map_err(|e| io_err(&paths.processing, e))? {
        let entry = entry.map_err(|e| io_err(&paths.processing, e))?;
        let path = entry.path();
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    for (index, processing_path) in entries.into_iter().enumerate() {
        let name = processing_path
            .file_name()
            .and_then(|v| v.to_str())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("wake.json");
        let target = paths.incoming.join(recovered_filename(index, name));
        fs::rename(&processing_path, &target).map_err(|e| io_err(&processing_path, e))?;
        recovered.push(target);
    }
    Ok(recovered)
}

fn recovered_filename(index: usize, name: &str) -> String {
    let ext = Path::new(name)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("json");
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("recovered_{index}_{hash}.{ext}")
}

#[derive(Debug)]
pub struct Scheduled<T> {
    pub group_id: String,
    pub value: T,
}

/// Per-group admission ordering: wakes for distinct groups interleave freely,
/// wakes for the same group come out strictly in arrival order and only one
/// is outstanding at a time.
#[derive(Debug)]
pub struct GroupScheduler<T> {
    pending: VecDeque<Scheduled<T>>,
    active_groups: HashSet<String>,
}

impl<T> Default for GroupScheduler<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            active_groups: HashSet::new(),
        }
    }
}

impl<T> GroupScheduler<T> {
    pub fn enqueue(&mut self, group_id: String, value: T) {
        self.pending.push_back(Scheduled { group_id, value });
    }

    pub fn dequeue_runnable(&mut self, max_items: usize) -> Vec<Scheduled<T>> {
        if max_items == 0 || self.pending.is_empty() {
            return Vec::new();
        }

        let mut selected = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(item) = self.pending.pop_front() {
            let group_busy = self.active_groups.contains(&item.group_id);
            if !group_busy && selected.len() < max_items {
                self.active_groups.insert(item.group_id.clone());
                selected.push(item);
            } else {
                remaining.push_back(item);
            }
        }
        self.pending = remaining;
        selected
    }

    pub fn complete(&mut self, group_id: &str) {
        self.active_groups.remove(group_id);
    }

    /// Put a dequeued item back at the head (cap-blocked admission) and
    /// release its group so the next pass retries it first.
    pub fn defer(&mut self, item: Scheduled<T>) {
        self.active_groups.remove(&item.group_id);
        self.pending.push_front(item);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn drain_pending(&mut self) -> Vec<Scheduled<T>> {
        self.pending.drain(..).collect()
    }
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn parse_err(path: &Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_in(dir: &Path) -> QueuePaths {
        let paths = QueuePaths::from_state_root(dir);
        paths.bootstrap().expect("bootstrap");
        paths
    }

    #[test]
    fn enqueue_then_claim_preserves_payload() {
        let tmp = tempdir().expect("tempdir");
        let queue = queue_in(tmp.path());

        let wake = enqueue_wake(
            &queue,
            "tg:family",
            WakeReason::Inbound,
            "hello",
            Some("alice"),
            100,
        )
        .expect("enqueue");

        let claim = claim_oldest(&queue).expect("claim").expect("present");
        assert_eq!(claim.payload, wake);
        assert!(claim.processing_path.exists());
        complete_wake(&claim).expect("complete");
        assert!(!claim.processing_path.exists());
    }

    #[test]
    fn claims_come_out_oldest_first() {
        let tmp = tempdir().expect("tempdir");
        let queue = queue_in(tmp.path());

        enqueue_wake(&queue, "g", WakeReason::Inbound, "first", None, 1).expect("enqueue");
        std::thread::sleep(std::time::Duration::from_millis(5));
        enqueue_wake(&queue, "g", WakeReason::Inbound, "second", None, 2).expect("enqueue");

        let first = claim_oldest(&queue).expect("claim").expect("present");
        assert_eq!(first.payload.message, "first");
    }

    #[test]
    fn dotfiles_and_foreign_files_are_skipped() {
        let tmp = tempdir().expect("tempdir");
        let queue = queue_in(tmp.path());
        fs::write(queue.incoming.join(".partial.json.tmp-1-2"), "{").expect("write");
        fs::write(queue.incoming.join("notes.txt"), "x").expect("write");

        assert!(claim_oldest(&queue).expect("claim").is_none());
    }

    #[test]
    fn recovery_requeues_orphaned_processing_files() {
        let tmp = tempdir().expect("tempdir");
        let queue = queue_in(tmp.path());
        enqueue_wake(&queue, "g", WakeReason::Inbound, "m", None, 1).expect("enqueue");
        let claim = claim_oldest(&queue).expect("claim").expect("present");

        // Simulate a crash: the processing file is still there.
        let recovered = recover_processing_entries(&queue).expect("recover");
        assert_eq!(recovered.len(), 1);
        assert!(!claim.processing_path.exists());
        let reclaimed = claim_oldest(&queue).expect("claim").expect("present");
        assert_eq!(reclaimed.payload.message, "m");
    }

    #[test]
    fn scheduler_serializes_same_group_and_interleaves_others() {
        let mut scheduler = GroupScheduler::default();
        scheduler.enqueue("a".to_string(), "a1");
        scheduler.enqueue("a".to_string(), "a2");
        scheduler.enqueue("b".to_string(), "b1");

        let batch = scheduler.dequeue_runnable(3);
        let values: Vec<_> = batch.iter().map(|s| s.value).collect();
        assert_eq!(values, vec!["a1", "b1"]);

        assert!(scheduler.dequeue_runnable(3).is_empty());
        scheduler.complete("a");
        let next = scheduler.dequeue_runnable(3);
        assert_eq!(next[0].value, "a2");
    }

    #[test]
    fn deferred_item_keeps_front_position() {
        let mut scheduler = GroupScheduler::default();
        scheduler.enqueue("a".to_string(), "a1");
        scheduler.enqueue("a".to_string(), "a2");

        let mut batch = scheduler.dequeue_runnable(1);
        let item = batch.remove(0);
        scheduler.defer(item);

        let retry = scheduler.dequeue_runnable(1);
        assert_eq!(retry[0].value, "a1");
    }
}
