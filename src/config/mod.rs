use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

mod error;

pub use error::ConfigError;

/// Host settings, loaded once from `config.yaml` at the state root.
///
/// The mount allowlist deliberately lives at a separate path outside the
/// managed workspace tree and is re-read on every session spawn; only its
/// location is configured here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub workspaces_path: PathBuf,
    pub allowlist_path: PathBuf,
    pub main_group_id: String,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupSeed>,
    #[serde(default)]
    pub limits: Limits,
    pub agent_runtime: AgentRuntimeSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSettings>,
}

/// Static group registration. Groups may also be created later through an
/// approved contact; these entries exist from first startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupSeed {
    pub display_name: String,
    pub workspace_folder: String,
    #[serde(default)]
    pub requires_trigger: bool,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    #[serde(default)]
    pub read_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Limits {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            idle_timeout_ms: default_idle_timeout_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            output_cap_bytes: default_output_cap_bytes(),
        }
    }
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_hard_timeout_ms() -> u64 {
    1_800_000
}

fn default_output_cap_bytes() -> u64 {
    1_048_576
}

/// The opaque agent runtime invoked per session. The binary receives the
/// session workspace as its working directory and the mailbox layout via
/// environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentRuntimeSettings {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            timezone: default_timezone(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    pub interval_seconds: u64,
    #[serde(default = "default_suppression_threshold")]
    pub suppression_threshold: usize,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
}

fn default_suppression_threshold() -> usize {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActiveHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub timezone: String,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspaces_path.is_absolute() {
            return Err(ConfigError::Settings(
                "workspaces_path must be absolute".to_string(),
            ));
        }
        if !self.allowlist_path.is_absolute() {
            return Err(ConfigError::Settings(
                "allowlist_path must be absolute".to_string(),
            ));
        }
        if self.allowlist_path.starts_with(&self.workspaces_path) {
            return Err(ConfigError::Settings(
                "allowlist_path must live outside the managed workspace tree".to_string(),
            ));
        }
        if self.main_group_id.trim().is_empty() {
            return Err(ConfigError::Settings(
                "main_group_id must be non-empty".to_string(),
            ));
        }
        if self.limits.max_concurrent_sessions == 0 {
            return Err(ConfigError::Settings(
                "limits.max_concurrent_sessions must be >= 1".to_string(),
            ));
        }
        if self.agent_runtime.binary.trim().is_empty() {
            return Err(ConfigError::Settings(
                "agent_runtime.binary must be non-empty".to_string(),
            ));
        }
        if self.scheduler.tick_seconds == 0 {
            return Err(ConfigError::Settings(
                "scheduler.tick_seconds must be >= 1".to_string(),
            ));
        }
        crate::scheduler::validate_iana_timezone(&self.scheduler.timezone)
            .map_err(ConfigError::Settings)?;

        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.interval_seconds == 0 {
                return Err(ConfigError::Settings(
                    "heartbeat.interval_seconds must be >= 1".to_string(),
                ));
            }
            if let Some(hours) = &heartbeat.active_hours {
                if hours.start_hour > 23 || hours.end_hour > 23 {
                    return Err(ConfigError::Settings(
                        "heartbeat.active_hours hours must be in 0..=23".to_string(),
                    ));
                }
                crate::scheduler::validate_iana_timezone(&hours.timezone)
                    .map_err(ConfigError::Settings)?;
            }
        }

        for (group_id, seed) in &self.groups {
            crate::shared::ids::validate_identifier_value("group id", group_id)
                .map_err(ConfigError::Settings)?;
            if seed.workspace_folder.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "group `{group_id}` workspace_folder must be non-empty"
                )));
            }
            for mount in &seed.mounts {
                if !mount.host_path.is_absolute() {
                    return Err(ConfigError::Settings(format!(
                        "group `{group_id}` mount `{}` must use an absolute host path",
                        mount.host_path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn group_workspace(&self, workspace_folder: &str) -> PathBuf {
        self.workspaces_path.join(workspace_folder)
    }

    pub fn heartbeat_group_id(&self) -> Option<&str> {
        self.heartbeat
            .as_ref()
            .map(|hb| hb.group_id.as_deref().unwrap_or(&self.main_group_id))
    }
}
