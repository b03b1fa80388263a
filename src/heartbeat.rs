use crate::config::{ActiveHours, HeartbeatSettings};
use crate::groups::require_approved;
use crate::scheduler::{ensure_task, ScheduleSpec};
use crate::store::{HostStore, TaskRecord};
use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Sentinel a healthy session puts in its heartbeat reply when nothing needs
/// the user's attention.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

pub const HEARTBEAT_TASK_ID: &str = "task-heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Routine all-clear; nothing is sent to the group.
    Suppress,
    /// The reply carries substance and goes out as a normal notification.
    Deliver,
}

/// Decide whether a heartbeat reply is a routine all-clear. Suppression is a
/// content-level judgement: the sentinel must be present and whatever text
/// remains after stripping it must fit under the threshold. A reply without
/// the sentinel is always delivered, however short.
pub fn classify_response(response: &str, suppression_threshold: usize) -> HeartbeatVerdict {
    if !response.contains(HEARTBEAT_OK) {
        return HeartbeatVerdict::Deliver;
    }
    let remainder: String = response
        .replace(HEARTBEAT_OK, "")
        .chars()
        .filter(|ch| !ch.is_whitespace() && !ch.is_ascii_punctuation())
        .collect();
    if remainder.chars().count() <= suppression_threshold {
        HeartbeatVerdict::Suppress
    } else {
        HeartbeatVerdict::Deliver
    }
}

/// Whether the local wall-clock hour falls inside the configured window.
/// Overnight windows (start > end, e.g. 22..6) wrap across midnight.
pub fn within_active_hours(hours: &ActiveHours, now: i64) -> Result<bool, String> {
    let tz: Tz = hours
        .timezone
        .parse()
        .map_err(|_| format!("invalid timezone `{}`; expected IANA timezone id", hours.timezone))?;
    let Some(utc_dt) = Utc.timestamp_opt(now, 0).single() else {
        return Err(format!("timestamp {now} is out of range"));
    };
    let hour = utc_dt.with_timezone(&tz).hour();
    Ok(if hours.start_hour <= hours.end_hour {
        hour >= hours.start_hour && hour < hours.end_hour
    } else {
        hour >= hours.start_hour || hour < hours.end_hour
    })
}

/// Register (or refresh) the heartbeat interval task at startup. The firing
/// cadence never changes outside active hours; the prompt instructs the
/// runtime to answer with the bare sentinel instead, so quiet hours are a
/// content policy rather than a scheduling hole.
pub fn ensure_heartbeat_task(
    store: &HostStore,
    settings: &HeartbeatSettings,
    group_id: &str,
    now: i64,
) -> Result<TaskRecord, String> {
    // A heartbeat wake for an unknown or blocked group would be dropped at
    // admission; surface that at registration time instead.
    require_approved(store, group_id).map_err(|err| err.to_string())?;
    let spec = ScheduleSpec::Interval {
        every_ms: settings.interval_seconds.saturating_mul(1000),
    };
    ensure_task(
        store,
        HEARTBEAT_TASK_ID,
        group_id,
        &heartbeat_prompt(settings.active_hours.as_ref()),
        &spec,
        true,
        now,
    )
}

fn heartbeat_prompt(active_hours: Option<&ActiveHours>) -> String {
    let mut prompt = String::from(
        "Periodic self-check. Review pending work, upcoming scheduled items and \
         anything that needs the user's attention. If nothing does, reply with \
         exactly HEARTBEAT_OK and no other content.",
    );
    if let Some(hours) = active_hours {
        prompt.push_str(&format!(
            " Quiet hours are in effect outside {:02}:00-{:02}:00 ({}); during \
             quiet hours reply HEARTBEAT_OK unless something is genuinely urgent.",
            hours.start_hour, hours.end_hour, hours.timezone
        ));
    }
    prompt
}
