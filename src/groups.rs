use crate::config::Settings;
use crate::shared::ids::validate_identifier_value;
use crate::shared::time::now_secs;
use crate::store::{ContactStatus, GroupRecord, HostStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown group `{group_id}`")]
    Unknown { group_id: String },
    #[error("invalid group id: {0}")]
    InvalidId(String),
    #[error("group `{group_id}` is blocked")]
    Blocked { group_id: String },
}

/// Seed the store from static settings registrations. Idempotent; existing
/// rows keep their contact status.
pub fn register_configured_groups(
    store: &HostStore,
    settings: &Settings,
) -> Result<usize, GroupError> {
    let mut registered = 0usize;
    for (group_id, seed) in &settings.groups {
        let existing = store.load_group(group_id)?;
        let record = GroupRecord {
            group_id: group_id.clone(),
            display_name: seed.display_name.clone(),
            workspace_folder: seed.workspace_folder.clone(),
            requires_trigger: seed.requires_trigger,
            contact_status: existing
                .as_ref()
                .map(|g| g.contact_status)
                .unwrap_or(ContactStatus::Approved),
            mounts: seed.mounts.clone(),
            created_at: existing.map(|g| g.created_at).unwrap_or_else(now_secs),
        };
        store.upsert_group(&record)?;
        registered += 1;
    }
    Ok(registered)
}

/// First approved contact creates the group with a derived workspace folder.
pub fn approve_contact(
    store: &HostStore,
    group_id: &str,
    display_name: &str,
    now: i64,
) -> Result<GroupRecord, GroupError> {
    validate_identifier_value("group id", group_id).map_err(GroupError::InvalidId)?;
    if let Some(mut existing) = store.load_group(group_id)? {
        if existing.contact_status == ContactStatus::Blocked {
            store.set_contact_status(group_id, ContactStatus::Approved)?;
            existing.contact_status = ContactStatus::Approved;
        }
        return Ok(existing);
    }

    let record = GroupRecord {
        group_id: group_id.to_string(),
        display_name: display_name.to_string(),
        workspace_folder: crate::shared::ids::group_dir_name(group_id),
        requires_trigger: false,
        contact_status: ContactStatus::Approved,
        mounts: Vec::new(),
        created_at: now,
    };
    store.upsert_group(&record)?;
    Ok(record)
}

/// Denial never deletes a group: the row survives, marked blocked.
pub fn deny_contact(store: &HostStore, group_id: &str) -> Result<(), GroupError> {
    if !store.set_contact_status(group_id, ContactStatus::Blocked)? {
        return Err(GroupError::Unknown {
            group_id: group_id.to_string(),
        });
    }
    Ok(())
}

pub fn require_approved(store: &HostStore, group_id: &str) -> Result<GroupRecord, GroupError> {
    let group = store
        .load_group(group_id)?
        .ok_or_else(|| GroupError::Unknown {
            group_id: group_id.to_string(),
        })?;
    if group.contact_status == ContactStatus::Blocked {
        return Err(GroupError::Blocked {
            group_id: group_id.to_string(),
        });
    }
    Ok(group)
}
