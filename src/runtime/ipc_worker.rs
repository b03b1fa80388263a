use super::logging::{append_runtime_log, append_security_log};
use super::workers::{sleep_with_stop, WorkerRunContext, IPC_POLL};
use crate::channels::{write_outbound, OutboundKind};
use crate::groups::{approve_contact, deny_contact, require_approved};
use crate::heartbeat::{classify_response, HeartbeatVerdict, HEARTBEAT_OK};
use crate::ipc::{
    authorize, collect_output_files, discard_duplicate, mark_processed, mark_rejected,
    write_input, InputMessage, OutputFile, OutputTask, SessionMailbox, TaskPayload,
};
use crate::queue::WakeReason;
use crate::scheduler::{cancel_task, create_task, validate_schedule, ScheduleSpec};
use crate::shared::ids::new_compact_id;
use crate::shared::time::now_secs;
use crate::store::GroupRecord;

/// Watches every group's output mailbox and dispatches session tasks.
/// Each output file is handled exactly once: dispatched then moved to
/// `processed`, or quarantined in `rejected`.
pub fn run_ipc_loop(worker_id: String, ctx: WorkerRunContext) {
    ctx.emit_started(&worker_id);

    while !ctx.stopping() {
        match ctx.store.list_groups() {
            Ok(groups) => {
                for group in groups {
                    process_group_mailbox(&ctx, &group);
                }
            }
            Err(err) => ctx.emit_error(&worker_id, &err.to_string(), false),
        }

        ctx.emit_heartbeat(&worker_id);
        if !sleep_with_stop(&ctx.stop, IPC_POLL) {
            break;
        }
    }

    ctx.emit_stopped(&worker_id);
}

fn process_group_mailbox(ctx: &WorkerRunContext, group: &GroupRecord) {
    let mailbox = SessionMailbox::for_group(&ctx.paths.root, &group.group_id);
    if !mailbox.output.exists() {
        return;
    }
    let files = match collect_output_files(&mailbox) {
        Ok(files) => files,
        Err(err) => {
            append_runtime_log(&ctx.paths, "warn", "ipc.scan.failed", &err.to_string());
            return;
        }
    };

    for file in files {
        match file {
            OutputFile::Duplicate(path) => {
                append_runtime_log(
                    &ctx.paths,
                    "info",
                    "ipc.duplicate.skipped",
                    &path.display().to_string(),
                );
                let _ = discard_duplicate(&path);
            }
            OutputFile::Rejected { path, error } => {
                append_runtime_log(
                    &ctx.paths,
                    "warn",
                    "ipc.task.rejected",
                    &format!("{}: {error}", path.display()),
                );
                let _ = mark_rejected(&mailbox, &path);
            }
            OutputFile::Task(task) => {
                if let Err(err) = authorize(&task, &group.group_id, &ctx.settings.main_group_id) {
                    append_security_log(&ctx.paths, "ipc.unauthorized", &err.to_string());
                    let _ = mark_rejected(&mailbox, &task.path);
                    continue;
                }
                match dispatch_task(ctx, group, &mailbox, &task) {
                    Ok(event) => {
                        append_runtime_log(
                            &ctx.paths,
                            "info",
                            event,
                            &format!("group={} file={}", group.group_id, task.file_name),
                        );
                        if let Err(err) = mark_processed(&mailbox, &task) {
                            append_runtime_log(
                                &ctx.paths,
                                "warn",
                                "ipc.mark_processed.failed",
                                &err.to_string(),
                            );
                        }
                    }
                    Err(err) => {
                        append_runtime_log(
                            &ctx.paths,
                            "error",
                            "ipc.task.failed",
                            &format!("group={} file={}: {err}", group.group_id, task.file_name),
                        );
                        let _ = mark_rejected(&mailbox, &task.path);
                    }
                }
            }
        }
    }
}

fn dispatch_task(
    ctx: &WorkerRunContext,
    group: &GroupRecord,
    mailbox: &SessionMailbox,
    task: &OutputTask,
) -> Result<&'static str, String> {
    let now = now_secs();
    match &task.envelope.payload {
        TaskPayload::SendMessage { to, message } => {
            require_approved(&ctx.store, to).map_err(|err| err.to_string())?;
            // Heartbeat replies answer with a sentinel; a routine all-clear
            // is suppressed instead of delivered.
            if let Some(hb) = &ctx.settings.heartbeat {
                if classify_response(message, hb.suppression_threshold)
                    == HeartbeatVerdict::Suppress
                {
                    return Ok("heartbeat.suppressed");
                }
            }
            let kind = if message.contains(HEARTBEAT_OK) {
                OutboundKind::Heartbeat
            } else {
                OutboundKind::Message
            };
            write_outbound(&ctx.paths.root, to, kind, message, now)
                .map_err(|err| err.to_string())?;
            Ok("ipc.message.queued")
        }
        TaskPayload::ScheduleTask { prompt, schedule } => {
            let spec: ScheduleSpec = serde_json::from_value(schedule.clone())
                .map_err(|err| format!("invalid schedule json: {err}"))?;
            validate_schedule(&spec)?;
            let created = create_task(&ctx.store, &group.group_id, prompt, &spec, false, now)?;
            append_runtime_log(
                &ctx.paths,
                "info",
                "scheduler.task.created",
                &format!("task={} group={}", created.task_id, group.group_id),
            );
            Ok("ipc.schedule.accepted")
        }
        TaskPayload::CancelTask { task_id } => {
            let existing = ctx
                .store
                .load_task(task_id.as_str())
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("unknown task `{task_id}`"))?;
            let is_main = group.group_id == ctx.settings.main_group_id;
            if existing.group_id != group.group_id && !is_main {
                append_security_log(
                    &ctx.paths,
                    "ipc.unauthorized",
                    &format!(
                        "group `{}` attempted to cancel task `{task_id}` owned by `{}`",
                        group.group_id, existing.group_id
                    ),
                );
                return Err(format!("task `{task_id}` belongs to another group"));
            }
            cancel_task(&ctx.store, task_id.as_str(), now)?;
            Ok("ipc.task.cancelled")
        }
        TaskPayload::ListTasks => {
            let tasks = ctx
                .store
                .list_tasks_for_group(&group.group_id)
                .map_err(|err| err.to_string())?;
            let listing: Vec<serde_json::Value> = tasks
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "taskId": t.task_id,
                        "prompt": t.prompt,
                        "status": t.status.as_str(),
                        "heartbeat": t.heartbeat,
                        "nextRunAt": t.next_run_at,
                        "lastRunAt": t.last_run_at,
                    })
                })
                .collect();
            let response = InputMessage {
                wake_id: new_compact_id("resp", now)?,
                reason: WakeReason::Inbound,
                message: serde_json::to_string(&listing)
                    .map_err(|err| format!("failed to encode task list: {err}"))?,
                sender: Some("wardend".to_string()),
                delivered_at: now,
            };
            write_input(mailbox, &response).map_err(|err| err.to_string())?;
            Ok("ipc.tasks.listed")
        }
        TaskPayload::ApproveContact {
            contact_id,
            display_name,
        } => {
            approve_contact(
                &ctx.store,
                contact_id,
                display_name.as_deref().unwrap_or(contact_id),
                now,
            )
            .map_err(|err| err.to_string())?;
            Ok("contacts.approved")
        }
        TaskPayload::DenyContact { contact_id } => {
            deny_contact(&ctx.store, contact_id).map_err(|err| err.to_string())?;
            Ok("contacts.blocked")
        }
    }
}
