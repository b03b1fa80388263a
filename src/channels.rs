use crate::groups::{require_approved, GroupError};
use crate::queue::{enqueue_wake, QueueError, QueuePaths, WakeReason, WakeRequest};
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::{new_compact_id, sanitize_filename_component};
use crate::store::HostStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Outbound text is capped so a runaway session cannot flood a transport.
pub const OUTBOUND_MESSAGE_CAP: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error("outbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build outbound id: {0}")]
    OutboundId(String),
}

/// Adapter-facing enqueue contract. Adapters normalize their own addressing
/// into a channel-qualified group id before calling in; unapproved groups
/// are rejected here, before anything touches the queue.
pub fn submit_inbound(
    store: &HostStore,
    queue: &QueuePaths,
    group_id: &str,
    sender: &str,
    message: &str,
    now: i64,
) -> Result<WakeRequest, ChannelError> {
    require_approved(store, group_id)?;
    Ok(enqueue_wake(
        queue,
        group_id,
        WakeReason::Inbound,
        message,
        Some(sender),
        now,
    )?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Message,
    CrashNotice,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub outbound_id: String,
    pub group_id: String,
    pub kind: OutboundKind,
    pub message: String,
    pub created_at: i64,
}

pub fn outbox_dir(state_root: &Path) -> PathBuf {
    state_root.join("outbox")
}

/// Queue a delivery for the transports. Text beyond the cap is truncated at
/// a char boundary with a marker, not rejected.
pub fn write_outbound(
    state_root: &Path,
    group_id: &str,
    kind: OutboundKind,
    message: &str,
    now: i64,
) -> Result<OutboundMessage, ChannelError> {
    let dir = outbox_dir(state_root);
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let outbound_id = new_compact_id("out", now).map_err(ChannelError::OutboundId)?;
    let outbound = OutboundMessage {
        outbound_id: outbound_id.clone(),
        group_id: group_id.to_string(),
        kind,
        message: truncate_outbound(message),
        created_at: now,
    };
    let path = dir.join(format!(
        "{}.json",
        sanitize_filename_component(&outbound_id)
    ));
    atomic_write_json(&path, &outbound).map_err(|e| io_err(&path, e))?;
    Ok(outbound)
}

/// Snapshot of pending deliveries, oldest id first. Transports remove the
/// files themselves once a delivery is confirmed.
pub fn list_outbound(state_root: &Path) -> Result<Vec<(PathBuf, OutboundMessage)>, ChannelError> {
    let dir = outbox_dir(state_root);
    let mut pending = Vec::new();
    if !dir.exists() {
        return Ok(pending);
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
        let entry = entry.map_err(|e| io_err(&dir, e))?;
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
        let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        if let Ok(message) = serde_json::from_str::<OutboundMessage>(&raw) {
            pending.push((path, message));
        }
    }
    Ok(pending)
}

fn truncate_outbound(message: &str) -> String {
    if message.chars().count() <= OUTBOUND_MESSAGE_CAP {
        return message.to_string();
    }
    let head: String = message.chars().take(OUTBOUND_MESSAGE_CAP - 1).collect();
    format!("{head}…")
}

fn io_err(path: &Path, source: std::io::Error) -> ChannelError {
    ChannelError::Io {
        path: path.display().to_string(),
        source,
    }
}
