use super::logging::{append_runtime_log, append_security_log};
use super::workers::{sleep_with_stop, WorkerRunContext, ADMISSION_POLL};
use crate::groups::require_approved;
use crate::queue::{
    claim_oldest, complete_wake, recover_processing_entries, requeue_failure, ClaimedWake,
    GroupScheduler, QueuePaths, Scheduled,
};
use crate::session::{Admission, SessionError};

/// The single admission loop: claims wakes from the file queue, keeps
/// per-group order through the group scheduler, and routes each wake into
/// the session manager. Cap- and drain-blocked wakes are deferred in memory
/// while their claimed files stay in `processing`, so a crash loses nothing.
pub fn run_admission_loop(worker_id: String, ctx: WorkerRunContext) {
    let queue = QueuePaths::from_state_root(&ctx.paths.root);
    if let Err(err) = queue.bootstrap() {
        ctx.emit_error(&worker_id, &err.to_string(), true);
        ctx.emit_stopped(&worker_id);
        return;
    }

    match recover_processing_entries(&queue) {
        Ok(recovered) if !recovered.is_empty() => {
            append_runtime_log(
                &ctx.paths,
                "info",
                "queue.recovered",
                &format!("requeued {} orphaned wakes", recovered.len()),
            );
        }
        Ok(_) => {}
        Err(err) => ctx.emit_error(&worker_id, &err.to_string(), false),
    }

    ctx.emit_started(&worker_id);
    let mut scheduler: GroupScheduler<ClaimedWake> = GroupScheduler::default();

    while !ctx.stopping() {
        loop {
            match claim_oldest(&queue) {
                Ok(Some(claim)) => {
                    let group_id = claim.payload.group_id.clone();
                    scheduler.enqueue(group_id, claim);
                }
                Ok(None) => break,
                Err(err) => {
                    ctx.emit_error(&worker_id, &err.to_string(), false);
                    break;
                }
            }
        }

        let batch = scheduler.dequeue_runnable(ctx.settings.limits.max_concurrent_sessions);
        for item in batch {
            handle_wake(&ctx, &queue, &mut scheduler, item);
        }

        ctx.emit_heartbeat(&worker_id);
        if !sleep_with_stop(&ctx.stop, ADMISSION_POLL) {
            break;
        }
    }

    // Put every undelivered wake back into incoming for the next start.
    for item in scheduler.drain_pending() {
        let _ = requeue_failure(&queue, &item.value);
    }
    ctx.emit_stopped(&worker_id);
}

fn handle_wake(
    ctx: &WorkerRunContext,
    queue: &QueuePaths,
    scheduler: &mut GroupScheduler<ClaimedWake>,
    item: Scheduled<ClaimedWake>,
) {
    let group_id = item.group_id.clone();

    let group = match require_approved(&ctx.store, &group_id) {
        Ok(group) => group,
        Err(err) => {
            append_security_log(
                &ctx.paths,
                "queue.wake.rejected",
                &format!("wake for `{group_id}` dropped: {err}"),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
            return;
        }
    };

    match ctx.manager.admit_wake(&group, &item.value.payload) {
        Ok(Admission::Delivered { session_id }) => {
            append_runtime_log(
                &ctx.paths,
                "info",
                "queue.wake.delivered",
                &format!("{} -> {session_id}", item.value.payload.wake_id),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
        }
        Ok(Admission::Spawned { session_id }) => {
            append_runtime_log(
                &ctx.paths,
                "info",
                "session.spawned",
                &format!("group={group_id} session={session_id}"),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
        }
        // Retry later without blocking other groups; defer keeps this wake
        // at the head of its group's order.
        Ok(Admission::Busy) | Ok(Admission::Capacity) => scheduler.defer(item),
        Err(SessionError::Mount(denial)) => {
            append_security_log(
                &ctx.paths,
                "mount.denied",
                &format!("group={group_id}: {denial}"),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
        }
        Err(SessionError::Allowlist(err)) => {
            append_security_log(
                &ctx.paths,
                "mount.allowlist.unreadable",
                &format!("group={group_id}: {err}"),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
        }
        Err(err) => {
            append_runtime_log(
                &ctx.paths,
                "error",
                "session.spawn.failed",
                &format!("group={group_id}: {err}"),
            );
            retire(ctx, &item.value);
            scheduler.complete(&group_id);
        }
    }
}

fn retire(ctx: &WorkerRunContext, claim: &ClaimedWake) {
    if let Err(err) = complete_wake(claim) {
        append_runtime_log(&ctx.paths, "warn", "queue.complete.failed", &err.to_string());
    }
}
