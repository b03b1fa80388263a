use crate::queue::WakeReason;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::TaskId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("mailbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid envelope in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("envelope {file} claims source group `{claimed}` but mailbox belongs to `{actual}`")]
    GroupMismatch {
        file: String,
        claimed: String,
        actual: String,
    },
    #[error("task kind `{kind}` from group `{group_id}` requires the main group")]
    MainGroupRequired { kind: String, group_id: String },
}

/// Per-session filesystem mailbox. The session communicates only through
/// these directories; the sandbox boundary never needs a network path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMailbox {
    pub input: PathBuf,
    pub output: PathBuf,
    pub processed: PathBuf,
    pub rejected: PathBuf,
}

impl SessionMailbox {
    pub fn for_group(state_root: &Path, group_id: &str) -> Self {
        let base = state_root
            .join("sessions")
            .join(crate::shared::ids::group_dir_name(group_id))
            .join("mailbox");
        Self {
            input: base.join("input"),
            output: base.join("output"),
            processed: base.join("processed"),
            rejected: base.join("rejected"),
        }
    }

    pub fn bootstrap(&self) -> Result<(), IpcError> {
        for dir in [&self.input, &self.output, &self.processed, &self.rejected] {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        Ok(())
    }
}

/// Host → session message, one json object per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMessage {
    pub wake_id: String,
    pub reason: WakeReason,
    pub message: String,
    #[serde(default)]
    pub sender: Option<String>,
    pub delivered_at: i64,
}

/// Deliver an input file into the mailbox. Write-then-rename so the runtime
/// never reads a partial file; the filename (wake id) is the at-most-once
/// consumption key on the session side.
pub fn write_input(mailbox: &SessionMailbox, input: &InputMessage) -> Result<PathBuf, IpcError> {
    fs::create_dir_all(&mailbox.input).map_err(|e| io_err(&mailbox.input, e))?;
    let path = mailbox.input.join(format!(
        "{}.json",
        crate::shared::ids::sanitize_filename_component(&input.wake_id)
    ));
    atomic_write_json(&path, input).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Session → host task payloads. Closed set: adding a kind is a
/// compile-time-checked change, not a stringly-typed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    SendMessage {
        to: String,
        message: String,
    },
    ScheduleTask {
        prompt: String,
        schedule: serde_json::Value,
    },
    CancelTask {
        task_id: TaskId,
    },
    ListTasks,
    ApproveContact {
        contact_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    DenyContact {
        contact_id: String,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::ScheduleTask { .. } => "schedule_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::ListTasks => "list_tasks",
            Self::ApproveContact { .. } => "approve_contact",
            Self::DenyContact { .. } => "deny_contact",
        }
    }

    /// Contact-layer mutations are reserved for the main group.
    pub fn requires_main_group(&self) -> bool {
        matches!(self, Self::ApproveContact { .. } | Self::DenyContact { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub source_group_id: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub payload: TaskPayload,
}

/// One parsed task with its file identity. The filename is the unique id
/// used for idempotent processing.
#[derive(Debug, Clone)]
pub struct OutputTask {
    pub file_name: String,
    pub path: PathBuf,
    pub envelope: TaskEnvelope,
}

pub enum OutputFile {
    Task(OutputTask),
    /// Already processed under the same unique id; replayed event.
    Duplicate(PathBuf),
    /// Unparseable; quarantined, never retried.
    Rejected { path: PathBuf, error: String },
}

/// Scan the output area. Dotfiles and non-json entries are ignored so a
/// producer using write-then-rename is never observed mid-write.
pub fn collect_output_files(mailbox: &SessionMailbox) -> Result<Vec<OutputFile>, IpcError> {
    let mut collected = Vec::new();
    if !mailbox.output.exists() {
        return Ok(collected);
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(&mailbox.output).map_err(|e| io_err(&mailbox.output, e))? {
        let entry = entry.map_err(|e| io_err(&mailbox.output, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(".json") || !path.is_file() {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if mailbox.processed.join(&name).exists() {
            collected.push(OutputFile::Duplicate(path));
            continue;
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                collected.push(OutputFile::Rejected {
                    path,
                    error: err.to_string(),
                });
                continue;
            }
        };
        match serde_json::from_str::<TaskEnvelope>(&raw) {
            Ok(envelope) => collected.push(OutputFile::Task(OutputTask {
                file_name: name,
                path,
                envelope,
            })),
            Err(err) => collected.push(OutputFile::Rejected {
                path,
                error: err.to_string(),
            }),
        }
    }
    Ok(collected)
}

/// The mailbox owner is the authorization signal; the envelope's claimed
/// source group is verified against it, never trusted on its own.
pub fn authorize(
    task: &OutputTask,
    mailbox_group_id: &str,
    main_group_id: &str,
) -> Result<(), IpcError> {
    if task.envelope.source_group_id != mailbox_group_id {
        return Err(IpcError::GroupMismatch {
            file: task.file_name.clone(),
            claimed: task.envelope.source_group_id.clone(),
            actual: mailbox_group_id.to_string(),
        });
    }
    if task.envelope.payload.requires_main_group() && mailbox_group_id != main_group_id {
        return Err(IpcError::MainGroupRequired {
            kind: task.envelope.payload.kind().to_string(),
            group_id: mailbox_group_id.to_string(),
        });
    }
    Ok(())
}

/// Retire a task file after dispatch. The processed marker carries the same
/// unique filename, making replays detectable.
pub fn mark_processed(mailbox: &SessionMailbox, task: &OutputTask) -> Result<(), IpcError> {
    fs::create_dir_all(&mailbox.processed).map_err(|e| io_err(&mailbox.processed, e))?;
    let target = mailbox.processed.join(&task.file_name);
    fs::rename(&task.path, &target).map_err(|e| io_err(&task.path, e))
}

pub fn mark_rejected(mailbox: &SessionMailbox, path: &Path) -> Result<(), IpcError> {
    fs::create_dir_all(&mailbox.rejected).map_err(|e| io_err(&mailbox.rejected, e))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("task.json");
    let target = mailbox.rejected.join(name);
    fs::rename(path, &target).map_err(|e| io_err(path, e))
}

pub fn discard_duplicate(path: &Path) -> Result<(), IpcError> {
    fs::remove_file(path).map_err(|e| io_err(path, e))
}

fn io_err(path: &Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        path: path.display().to_string(),
        source,
    }
}
