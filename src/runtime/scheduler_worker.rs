use super::logging::append_runtime_log;
use super::workers::{sleep_with_stop, WorkerRunContext};
use crate::heartbeat::ensure_heartbeat_task;
use crate::queue::QueuePaths;
use crate::scheduler;
use crate::shared::time::now_secs;
use std::time::Duration;

/// Coarse scheduler loop: one `tick` per configured interval. Firing before
/// persisting gives at-least-once semantics across a crash.
pub fn run_scheduler_loop(worker_id: String, ctx: WorkerRunContext) {
    let queue = QueuePaths::from_state_root(&ctx.paths.root);

    if let Some(hb) = &ctx.settings.heartbeat {
        let group_id = ctx
            .settings
            .heartbeat_group_id()
            .unwrap_or(&ctx.settings.main_group_id);
        match ensure_heartbeat_task(&ctx.store, hb, group_id, now_secs()) {
            Ok(task) => append_runtime_log(
                &ctx.paths,
                "info",
                "heartbeat.task.registered",
                &format!("task={} group={group_id}", task.task_id),
            ),
            Err(err) => {
                append_runtime_log(
                    &ctx.paths,
                    "warn",
                    "heartbeat.task.skipped",
                    &format!("group={group_id}: {err}"),
                );
                ctx.emit_error(&worker_id, &err, false);
            }
        }
    }

    ctx.emit_started(&worker_id);
    let tick_interval = Duration::from_secs(ctx.settings.scheduler.tick_seconds.max(1));

    while !ctx.stopping() {
        match scheduler::tick(&ctx.store, &queue, now_secs()) {
            Ok(outcome) => {
                for fired in &outcome.fired {
                    append_runtime_log(
                        &ctx.paths,
                        "info",
                        "scheduler.task.fired",
                        &format!(
                            "task={} group={} wake={} heartbeat={}",
                            fired.task_id, fired.group_id, fired.wake_id, fired.heartbeat
                        ),
                    );
                }
                for disabled in &outcome.disabled {
                    append_runtime_log(
                        &ctx.paths,
                        "warn",
                        "scheduler.task.disabled",
                        &format!("task={}: {}", disabled.task_id, disabled.error),
                    );
                }
            }
            Err(err) => ctx.emit_error(&worker_id, &err, false),
        }

        ctx.emit_heartbeat(&worker_id);
        if !sleep_with_stop(&ctx.stop, tick_interval) {
            break;
        }
    }

    ctx.emit_stopped(&worker_id);
}
