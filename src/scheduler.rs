use crate::queue::{enqueue_wake, QueuePaths, WakeReason};
use crate::shared::ids::new_compact_id;
use crate::store::{HostStore, TaskRecord, TaskStatus};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// Five years of minutes; a cron expression that never matches within this
// horizon is treated as unsatisfiable.
const MAX_CRON_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;

const MAX_INTERVAL_MS: u64 = 31_536_000_000;

/// When a task should fire. Persisted as the opaque schedule json on the
/// task row; this module owns its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Cron {
        expression: String,
        timezone: String,
    },
    #[serde(rename_all = "camelCase")]
    Interval { every_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Once { run_at: i64 },
}

pub fn parse_schedule(raw: &str) -> Result<ScheduleSpec, String> {
    let spec: ScheduleSpec =
        serde_json::from_str(raw).map_err(|err| format!("invalid schedule json: {err}"))?;
    validate_schedule(&spec)?;
    Ok(spec)
}

pub fn validate_schedule(spec: &ScheduleSpec) -> Result<(), String> {
    match spec {
        ScheduleSpec::Once { .. } => Ok(()),
        ScheduleSpec::Interval { every_ms } => {
            if *every_ms == 0 {
                return Err("interval.everyMs must be >= 1".to_string());
            }
            if *every_ms > MAX_INTERVAL_MS {
                return Err(format!("interval.everyMs must be <= {MAX_INTERVAL_MS}"));
            }
            Ok(())
        }
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            parse_cron_expression(expression)?;
            validate_iana_timezone(timezone)
        }
    }
}

pub fn validate_iana_timezone(raw: &str) -> Result<(), String> {
    raw.parse::<Tz>()
        .map(|_| ())
        .map_err(|_| format!("invalid timezone `{raw}`; expected IANA timezone id"))
}

/// Next firing time strictly after the base point. `last_fired_at = None`
/// means the task has never fired; `Ok(None)` means it never fires again.
pub fn compute_next_run_at(
    spec: &ScheduleSpec,
    now: i64,
    last_fired_at: Option<i64>,
) -> Result<Option<i64>, String> {
    match spec {
        ScheduleSpec::Once { run_at } => {
            if last_fired_at.is_some() {
                Ok(None)
            } else {
                Ok(Some(*run_at))
            }
        }
        ScheduleSpec::Interval { every_ms } => {
            if *every_ms == 0 {
                return Err("interval.everyMs must be >= 1".to_string());
            }
            let step_seconds = ((*every_ms).div_ceil(1000)) as i64;
            let base = last_fired_at.unwrap_or(now);
            Ok(Some(base.saturating_add(step_seconds)))
        }
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            let tz = timezone
                .parse::<Tz>()
                .map_err(|_| format!("invalid timezone `{timezone}`; expected IANA timezone id"))?;
            let cron = parse_cron_expression(expression)?;
            // Scan forward from the next whole minute after the base point.
            let base = last_fired_at.unwrap_or(now);
            let mut candidate = ((base / 60) + 1) * 60;
            for _ in 0..MAX_CRON_SEARCH_MINUTES {
                if cron_matches(&cron, candidate, &tz) {
                    return Ok(Some(candidate));
                }
                candidate = candidate.saturating_add(60);
            }
            Err(format!(
                "unable to compute next run for cron expression `{expression}` in timezone `{timezone}`"
            ))
        }
    }
}

pub fn create_task(
    store: &HostStore,
    group_id: &str,
    prompt: &str,
    spec: &ScheduleSpec,
    heartbeat: bool,
    now: i64,
) -> Result<TaskRecord, String> {
    validate_schedule(spec)?;
    if prompt.trim().is_empty() {
        return Err("task prompt must be non-empty".to_string());
    }
    let task_id = new_compact_id("task", now)?;
    let record = TaskRecord {
        task_id,
        group_id: group_id.to_string(),
        prompt: prompt.to_string(),
        schedule_json: encode_schedule(spec)?,
        status: TaskStatus::Active,
        heartbeat,
        next_run_at: compute_next_run_at(spec, now, None)?,
        last_run_at: None,
        created_at: now,
        updated_at: now,
    };
    store.upsert_task(&record).map_err(|err| err.to_string())?;
    Ok(record)
}

/// Create or refresh a task under a fixed id. Existing rows keep their
/// creation time and firing history; the schedule and prompt are replaced.
pub fn ensure_task(
    store: &HostStore,
    task_id: &str,
    group_id: &str,
    prompt: &str,
    spec: &ScheduleSpec,
    heartbeat: bool,
    now: i64,
) -> Result<TaskRecord, String> {
    validate_schedule(spec)?;
    let existing = store.load_task(task_id).map_err(|err| err.to_string())?;
    let record = TaskRecord {
        task_id: task_id.to_string(),
        group_id: group_id.to_string(),
        prompt: prompt.to_string(),
        schedule_json: encode_schedule(spec)?,
        status: TaskStatus::Active,
        heartbeat,
        next_run_at: compute_next_run_at(
            spec,
            now,
            existing.as_ref().and_then(|t| t.last_run_at),
        )?,
        last_run_at: existing.as_ref().and_then(|t| t.last_run_at),
        created_at: existing.as_ref().map(|t| t.created_at).unwrap_or(now),
        updated_at: now,
    };
    store.upsert_task(&record).map_err(|err| err.to_string())?;
    Ok(record)
}

/// Cancellation is a status transition, never a row delete: the task and its
/// firing history stay queryable.
pub fn cancel_task(store: &HostStore, task_id: &str, now: i64) -> Result<TaskRecord, String> {
    let mut task = store
        .load_task(task_id)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("unknown task `{task_id}`"))?;
    task.status = TaskStatus::Done;
    task.next_run_at = None;
    task.updated_at = now;
    store.upsert_task(&task).map_err(|err| err.to_string())?;
    Ok(task)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTask {
    pub task_id: String,
    pub group_id: String,
    pub wake_id: String,
    pub heartbeat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisabledTask {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub fired: Vec<FiredTask>,
    pub disabled: Vec<DisabledTask>,
}

/// One scheduler pass: fire every active task that is due, then advance its
/// next run time and persist. The fire happens before the persist, so a
/// crash in between duplicates at most one wake and never loses one. A task
/// whose due time is already in the past fires once and has its next run
/// advanced past every missed occurrence.
pub fn tick(store: &HostStore, queue: &QueuePaths, now: i64) -> Result<TickOutcome, String> {
    let mut outcome = TickOutcome::default();

    for mut task in store.list_tasks().map_err(|err| err.to_string())? {
        if task.status != TaskStatus::Active {
            continue;
        }

        let spec = match parse_schedule(&task.schedule_json) {
            Ok(spec) => spec,
            Err(error) => {
                // A broken schedule disables that task only; the host and
                // every other task keep running.
                pause_broken_task(store, task, error, now, &mut outcome)?;
                continue;
            }
        };

        let due = match task.next_run_at {
            Some(due) => due,
            None => {
                // Backfill a missing next run (e.g. row written by an older
                // build) without firing.
                match compute_next_run_at(&spec, now, task.last_run_at) {
                    Ok(next) => {
                        task.next_run_at = next;
                        task.updated_at = now;
                        store.upsert_task(&task).map_err(|err| err.to_string())?;
                    }
                    Err(error) => pause_broken_task(store, task, error, now, &mut outcome)?,
                }
                continue;
            }
        };
        if due > now {
            continue;
        }

        let reason = if task.heartbeat {
            WakeReason::Heartbeat {
                task_id: task.task_id.clone(),
            }
        } else {
            WakeReason::Scheduled {
                task_id: task.task_id.clone(),
            }
        };
        let wake = enqueue_wake(queue, &task.group_id, reason, &task.prompt, None, now)
            .map_err(|err| err.to_string())?;
        outcome.fired.push(FiredTask {
            task_id: task.task_id.clone(),
            group_id: task.group_id.clone(),
            wake_id: wake.wake_id,
            heartbeat: task.heartbeat,
        });

        task.last_run_at = Some(now);
        // The wake is already out; an unsatisfiable schedule here pauses the
        // task so it cannot re-fire on every subsequent pass.
        match compute_next_run_at(&spec, now, Some(now)) {
            Ok(next) => {
                task.next_run_at = next;
                if task.next_run_at.is_none() {
                    task.status = TaskStatus::Done;
                }
                task.updated_at = now;
                store.upsert_task(&task).map_err(|err| err.to_string())?;
            }
            Err(error) => pause_broken_task(store, task, error, now, &mut outcome)?,
        }
    }

    Ok(outcome)
}

fn pause_broken_task(
    store: &HostStore,
    mut task: TaskRecord,
    error: String,
    now: i64,
    outcome: &mut TickOutcome,
) -> Result<(), String> {
    task.status = TaskStatus::Paused;
    task.next_run_at = None;
    task.updated_at = now;
    store.upsert_task(&task).map_err(|err| err.to_string())?;
    outcome.disabled.push(DisabledTask {
        task_id: task.task_id,
        error,
    });
    Ok(())
}

fn encode_schedule(spec: &ScheduleSpec) -> Result<String, String> {
    serde_json::to_string(spec).map_err(|err| format!("failed to encode schedule: {err}"))
}

/// One cron field; `None` is the `*` wildcard.
#[derive(Debug, Clone)]
struct CronField(Option<BTreeSet<u32>>);

impl CronField {
    fn any() -> Self {
        Self(None)
    }

    fn is_any(&self) -> bool {
        self.0.is_none()
    }

    fn matches(&self, value: u32) -> bool {
        match &self.0 {
            None => true,
            Some(values) => values.contains(&value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

pub fn parse_cron_expression(raw: &str) -> Result<CronExpression, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(
            "cron expression must use 5 fields: minute hour day_of_month month day_of_week"
                .to_string(),
        );
    }

    Ok(CronExpression {
        minute: parse_cron_field(fields[0], 0, 59, AliasKind::None)?,
        hour: parse_cron_field(fields[1], 0, 23, AliasKind::None)?,
        day_of_month: parse_cron_field(fields[2], 1, 31, AliasKind::None)?,
        month: parse_cron_field(fields[3], 1, 12, AliasKind::Month)?,
        day_of_week: parse_cron_field(fields[4], 0, 7, AliasKind::Weekday)?,
    })
}

fn cron_matches(expr: &CronExpression, unix_ts: i64, timezone: &Tz) -> bool {
    let Some(utc_dt) = Utc.timestamp_opt(unix_ts, 0).single() else {
        return false;
    };
    let local = utc_dt.with_timezone(timezone);

    if !expr.minute.matches(local.minute())
        || !expr.hour.matches(local.hour())
        || !expr.month.matches(local.month())
    {
        return false;
    }

    let dom = expr.day_of_month.matches(local.day());
    let dow = expr
        .day_of_week
        .matches(local.weekday().num_days_from_sunday());

    // Standard cron: when both day fields are restricted, either matching
    // is enough; otherwise both must match.
    if expr.day_of_month.is_any() || expr.day_of_week.is_any() {
        dom && dow
    } else {
        dom || dow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    None,
    Month,
    Weekday,
}

fn parse_cron_field(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<CronField, String> {
    if raw == "*" {
        return Ok(CronField::any());
    }

    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_cron_segment(segment, min, max, aliases, &mut values)?;
    }
    if values.is_empty() {
        return Err(format!("invalid cron field `{raw}`"));
    }
    Ok(CronField(Some(values)))
}

fn parse_cron_segment(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
    values: &mut BTreeSet<u32>,
) -> Result<(), String> {
    let (range_raw, step) = match raw.split_once('/') {
        Some((range, step_raw)) => {
            let step = step_raw
                .parse::<u32>()
                .map_err(|_| format!("invalid cron step `{step_raw}`"))?;
            if step == 0 {
                return Err("cron step must be >= 1".to_string());
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range_raw == "*" {
        (min, max)
    } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
        (
            parse_cron_atom(start_raw, min, max, aliases)?,
            parse_cron_atom(end_raw, min, max, aliases)?,
        )
    } else {
        let value = parse_cron_atom(range_raw, min, max, aliases)?;
        (value, value)
    };

    if start > end {
        return Err(format!("invalid cron range `{raw}`"));
    }

    let mut value = start;
    while value <= end {
        // Both 0 and 7 mean Sunday.
        let normalized = if aliases == AliasKind::Weekday && value == 7 {
            0
        } else {
            value
        };
        values.insert(normalized);
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(())
}

fn parse_cron_atom(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    let value = match aliases {
        AliasKind::None => lower
            .parse::<u32>()
            .map_err(|_| format!("invalid cron value `{raw}`"))?,
        AliasKind::Month => match lower.as_str() {
            "jan" => 1,
            "feb" => 2,
            "mar" => 3,
            "apr" => 4,
            "may" => 5,
            "jun" => 6,
            "jul" => 7,
            "aug" => 8,
            "sep" => 9,
            "oct" => 10,
            "nov" => 11,
            "dec" => 12,
            _ => lower
                .parse::<u32>()
                .map_err(|_| format!("invalid cron value `{raw}`"))?,
        },
        AliasKind::Weekday => match lower.as_str() {
            "sun" => 0,
            "mon" => 1,
            "tue" => 2,
            "wed" => 3,
            "thu" => 4,
            "fri" => 5,
            "sat" => 6,
            _ => lower
                .parse::<u32>()
                .map_err(|_| format!("invalid cron value `{raw}`"))?,
        },
    };

    if value < min || value > max {
        return Err(format!(
            "cron value `{raw}` is out of bounds ({min}..={max})"
        ));
    }
    Ok(value)
}
