use crate::config::MountSpec;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid stored value `{value}` for {column}")]
    InvalidColumn { column: String, value: String },
    #[error("failed to encode stored json: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

fn sql_err(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    Approved,
    Blocked,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Blocked => "blocked",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "approved" => Ok(Self::Approved),
            "blocked" => Ok(Self::Blocked),
            other => Err(StoreError::InvalidColumn {
                column: "contact_status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group_id: String,
    pub display_name: String,
    pub workspace_folder: String,
    pub requires_trigger: bool,
    pub contact_status: ContactStatus,
    pub mounts: Vec<MountSpec>,
    pub created_at: i64,
}

/// Final session state persisted on termination so continuity survives a
/// host restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCheckpoint {
    pub group_id: String,
    pub last_wake_id: Option<String>,
    pub continuity_marker: Option<String>,
    pub exit_reason: String,
    pub terminated_at: i64,
}

/// Single-file relational store for groups, scheduled tasks and session
/// checkpoints. Connection-per-operation keeps the handle trivially Sync.
#[derive(Debug, Clone)]
pub struct HostStore {
    db_path: PathBuf,
}

impl HostStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS groups (
                    group_id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    workspace_folder TEXT NOT NULL,
                    requires_trigger INTEGER NOT NULL,
                    contact_status TEXT NOT NULL,
                    mounts_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS scheduled_tasks (
                    task_id TEXT PRIMARY KEY,
                    group_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    schedule_json TEXT NOT NULL,
                    status TEXT NOT NULL,
                    heartbeat INTEGER NOT NULL DEFAULT 0,
                    next_run_at INTEGER,
                    last_run_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS session_checkpoints (
                    group_id TEXT PRIMARY KEY,
                    last_wake_id TEXT,
                    continuity_marker TEXT,
                    exit_reason TEXT NOT NULL,
                    terminated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(sql_err)
    }

    pub fn upsert_group(&self, record: &GroupRecord) -> Result<(), StoreError> {
        let mounts_json = serde_json::to_string(&record.mounts)
            .map_err(|source| StoreError::Encode { source })?;
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO groups
                 (group_id, display_name, workspace_folder, requires_trigger,
                  contact_status, mounts_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(group_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   workspace_folder = excluded.workspace_folder,
                   requires_trigger = excluded.requires_trigger,
                   mounts_json = excluded.mounts_json",
                params![
                    record.group_id,
                    record.display_name,
                    record.workspace_folder,
                    record.requires_trigger as i64,
                    record.contact_status.as_str(),
                    mounts_json,
                    record.created_at,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn load_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT group_id, display_name, workspace_folder, requires_trigger,
                        contact_status, mounts_json, created_at
                 FROM groups WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        let Some((id, display_name, workspace_folder, requires_trigger, status, mounts_json, created_at)) =
            row
        else {
            return Ok(None);
        };
        let mounts: Vec<MountSpec> =
            serde_json::from_str(&mounts_json).map_err(|_| StoreError::InvalidColumn {
                column: "mounts_json".to_string(),
                value: mounts_json.clone(),
            })?;
        Ok(Some(GroupRecord {
            group_id: id,
            display_name,
            workspace_folder,
            requires_trigger: requires_trigger != 0,
            contact_status: ContactStatus::parse(&status)?,
            mounts,
            created_at,
        }))
    }

    pub fn list_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT group_id FROM groups ORDER BY group_id")
            .map_err(sql_err)?;
        let ids: Vec<String> = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<Result<_, _>>()
            .map_err(sql_err)?;
        drop(statement);
        drop(connection);

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.load_group(&id)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Groups are never deleted; contact disposition is a status flip.
    pub fn set_contact_status(
        &self,
        group_id: &str,
        status: ContactStatus,
    ) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                "UPDATE groups SET contact_status = ?2 WHERE group_id = ?1",
                params![group_id, status.as_str()],
            )
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    pub fn save_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO session_checkpoints
                 (group_id, last_wake_id, continuity_marker, exit_reason, terminated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(group_id) DO UPDATE SET
                   last_wake_id = excluded.last_wake_id,
                   continuity_marker = excluded.continuity_marker,
                   exit_reason = excluded.exit_reason,
                   terminated_at = excluded.terminated_at",
                params![
                    checkpoint.group_id,
                    checkpoint.last_wake_id,
                    checkpoint.continuity_marker,
                    checkpoint.exit_reason,
                    checkpoint.terminated_at,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn load_checkpoint(&self, group_id: &str) -> Result<Option<SessionCheckpoint>, StoreError> {
        let connection = self.connect()?;
        connection
            .query_row(
                "SELECT group_id, last_wake_id, continuity_marker, exit_reason, terminated_at
                 FROM session_checkpoints WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok(SessionCheckpoint {
                        group_id: row.get(0)?,
                        last_wake_id: row.get(1)?,
                        continuity_marker: row.get(2)?,
                        exit_reason: row.get(3)?,
                        terminated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            other => Err(StoreError::InvalidColumn {
                column: "status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Raw scheduled-task row. The schedule itself is opaque json here; the
/// scheduler module owns its shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: String,
    pub group_id: String,
    pub prompt: String,
    pub schedule_json: String,
    pub status: TaskStatus,
    pub heartbeat: bool,
    pub next_run_at: Option<i64>,
    pub last_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl HostStore {
    pub fn upsert_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO scheduled_tasks
                 (task_id, group_id, prompt, schedule_json, status, heartbeat,
                  next_run_at, last_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(task_id) DO UPDATE SET
                   group_id = excluded.group_id,
                   prompt = excluded.prompt,
                   schedule_json = excluded.schedule_json,
                   status = excluded.status,
                   heartbeat = excluded.heartbeat,
                   next_run_at = excluded.next_run_at,
                   last_run_at = excluded.last_run_at,
                   updated_at = excluded.updated_at",
                params![
                    record.task_id,
                    record.group_id,
                    record.prompt,
                    record.schedule_json,
                    record.status.as_str(),
                    record.heartbeat as i64,
                    record.next_run_at,
                    record.last_run_at,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn load_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let connection = self.connect()?;
        connection
            .query_row(
                "SELECT task_id, group_id, prompt, schedule_json, status, heartbeat,
                        next_run_at, last_run_at, created_at, updated_at
                 FROM scheduled_tasks WHERE task_id = ?1",
                params![task_id],
                Self::task_from_row,
            )
            .optional()
            .map_err(sql_err)?
            .map(Self::decode_task)
            .transpose()
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT task_id, group_id, prompt, schedule_json, status, heartbeat,
                        next_run_at, last_run_at, created_at, updated_at
                 FROM scheduled_tasks ORDER BY task_id",
            )
            .map_err(sql_err)?;
        let rows: Vec<RawTask> = statement
            .query_map([], Self::task_from_row)
            .map_err(sql_err)?
            .collect::<Result<_, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(Self::decode_task).collect()
    }

    pub fn list_tasks_for_group(&self, group_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|task| task.group_id == group_id)
            .collect())
    }

    #[allow(clippy::type_complexity)]
    fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
        ))
    }

    fn decode_task(raw: RawTask) -> Result<TaskRecord, StoreError> {
        let (
            task_id,
            group_id,
            prompt,
            schedule_json,
            status,
            heartbeat,
            next_run_at,
            last_run_at,
            created_at,
            updated_at,
        ) = raw;
        Ok(TaskRecord {
            task_id,
            group_id,
            prompt,
            schedule_json,
            status: TaskStatus::parse(&status)?,
            heartbeat: heartbeat != 0,
            next_run_at,
            last_run_at,
            created_at,
            updated_at,
        })
    }
}

type RawTask = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
);
