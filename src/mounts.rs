use crate::config::MountSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Allowlist document. Stored outside the managed workspace tree so a
/// compromised session can never rewrite its own permission boundary, and
/// re-read on every spawn so edits apply without a restart.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub non_main_read_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: PathBuf,
    pub allow_read_write: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

/// A mount that passed validation. `host_path` is canonical (symlinks fully
/// resolved) and `read_write` reflects the effective grant, which may be
/// narrower than what the group requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_write: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MountDenial {
    #[error("mount path `{path}` must be absolute")]
    NotAbsolute { path: String },
    #[error("mount path `{path}` cannot be resolved: {source}")]
    Unresolvable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mount path `{path}` resolves outside every allowlist root")]
    OutsideAllowlist { path: String },
    #[error("mount path `{path}` matches blocked pattern `{pattern}`")]
    BlockedPattern { path: String, pattern: String },
    #[error("mount path `{path}` would expose the allowlist file")]
    AllowlistExposure { path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("failed to read allowlist {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid allowlist json in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("allowlist root `{path}` must be absolute")]
    RelativeRoot { path: String },
}

pub fn load_allowlist(path: &Path) -> Result<MountAllowlist, AllowlistError> {
    let raw = fs::read_to_string(path).map_err(|source| AllowlistError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let allowlist: MountAllowlist =
        serde_json::from_str(&raw).map_err(|source| AllowlistError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    for root in &allowlist.allowed_roots {
        if !root.path.is_absolute() {
            return Err(AllowlistError::RelativeRoot {
                path: root.path.display().to_string(),
            });
        }
    }
    Ok(allowlist)
}

/// Validate one requested mount against the allowlist. Pure apart from path
/// resolution; never cached across spawns.
pub fn validate_mount(
    request: &MountSpec,
    allowlist: &MountAllowlist,
    allowlist_path: &Path,
    is_main_group: bool,
) -> Result<ApprovedMount, MountDenial> {
    if !request.host_path.is_absolute() {
        return Err(MountDenial::NotAbsolute {
            path: request.host_path.display().to_string(),
        });
    }

    // Resolve symlinks fully: a link whose literal path sits inside a root but
    // whose target escapes it must be judged by the target.
    let canonical = match fs::canonicalize(&request.host_path) {
        Ok(resolved) => normalize_absolute(&resolved)?,
        Err(source) => {
            return Err(MountDenial::Unresolvable {
                path: request.host_path.display().to_string(),
                source,
            })
        }
    };

    let matched = allowlist
        .allowed_roots
        .iter()
        .filter_map(|root| {
            let resolved_root = fs::canonicalize(&root.path)
                .map_or_else(|_| root.path.clone(), |resolved| resolved);
            let normalized_root = normalize_absolute(&resolved_root).ok()?;
            canonical
                .starts_with(&normalized_root)
                .then_some((root, normalized_root))
        })
        .max_by_key(|(_, normalized_root)| normalized_root.components().count());
    let Some((matched_root, _)) = matched else {
        return Err(MountDenial::OutsideAllowlist {
            path: canonical.display().to_string(),
        });
    };

    let candidate = canonical.display().to_string();
    for pattern in allowlist
        .blocked_patterns
        .iter()
        .chain(matched_root.blocked_patterns.iter())
    {
        if !pattern.is_empty() && candidate.contains(pattern.as_str()) {
            return Err(MountDenial::BlockedPattern {
                path: candidate,
                pattern: pattern.clone(),
            });
        }
    }

    // The allowlist file itself must never be reachable through a grant.
    let allowlist_canonical = fs::canonicalize(allowlist_path)
        .ok()
        .and_then(|p| normalize_absolute(&p).ok())
        .unwrap_or_else(|| allowlist_path.to_path_buf());
    if allowlist_canonical == canonical || allowlist_canonical.starts_with(&canonical) {
        return Err(MountDenial::AllowlistExposure { path: candidate });
    }

    let mut read_write = request.read_write && matched_root.allow_read_write;
    if allowlist.non_main_read_only && !is_main_group {
        read_write = false;
    }

    Ok(ApprovedMount {
        host_path: canonical,
        container_path: request.container_path.clone(),
        read_write,
    })
}

/// Validate a group's full mount set. Fails closed: the first denial aborts
/// the whole set so a session never starts with partial mounts.
pub fn validate_mount_set(
    requests: &[MountSpec],
    allowlist: &MountAllowlist,
    allowlist_path: &Path,
    is_main_group: bool,
) -> Result<Vec<ApprovedMount>, MountDenial> {
    let mut approved = Vec::with_capacity(requests.len());
    for request in requests {
        approved.push(validate_mount(
            request,
            allowlist,
            allowlist_path,
            is_main_group,
        )?);
    }
    Ok(approved)
}

fn normalize_absolute(path: &Path) -> Result<PathBuf, MountDenial> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::Normal(v) => normalized.push(v),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(MountDenial::OutsideAllowlist {
                        path: path.display().to_string(),
                    });
                }
            }
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }
    Ok(normalized)
}
