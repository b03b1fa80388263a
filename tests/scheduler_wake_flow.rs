use tempfile::tempdir;
use wardend::queue::{claim_oldest, complete_wake, QueuePaths, WakeReason};
use wardend::scheduler::{compute_next_run_at, create_task, tick, ScheduleSpec};
use wardend::store::{HostStore, TaskStatus};

fn setup(dir: &std::path::Path) -> (HostStore, QueuePaths) {
    let store = HostStore::open(&dir.join("host.db")).expect("open store");
    let queue = QueuePaths::from_state_root(dir);
    queue.bootstrap().expect("bootstrap queue");
    (store, queue)
}

#[test]
fn due_interval_task_fires_a_scheduled_wake() {
    let tmp = tempdir().expect("tempdir");
    let (store, queue) = setup(tmp.path());

    let spec = ScheduleSpec::Interval { every_ms: 60_000 };
    let task = create_task(&store, "tg:family", "water the plants", &spec, false, 1_000)
        .expect("create task");
    assert_eq!(task.next_run_at, Some(1_060));

    // Not due yet.
    let early = tick(&store, &queue, 1_030).expect("tick");
    assert!(early.fired.is_empty());
    assert!(claim_oldest(&queue).expect("claim").is_none());

    let outcome = tick(&store, &queue, 1_060).expect("tick");
    assert_eq!(outcome.fired.len(), 1);
    assert_eq!(outcome.fired[0].task_id, task.task_id);

    let claim = claim_oldest(&queue).expect("claim").expect("wake present");
    assert_eq!(claim.payload.group_id, "tg:family");
    assert_eq!(claim.payload.message, "water the plants");
    assert_eq!(
        claim.payload.reason,
        WakeReason::Scheduled {
            task_id: task.task_id.clone()
        }
    );
    complete_wake(&claim).expect("complete");

    // The task advanced past the fire time and stays active.
    let reloaded = store.load_task(&task.task_id).expect("load").expect("row");
    assert_eq!(reloaded.status, TaskStatus::Active);
    assert_eq!(reloaded.last_run_at, Some(1_060));
    assert_eq!(reloaded.next_run_at, Some(1_120));
}

#[test]
fn once_task_fires_a_single_time_then_completes() {
    let tmp = tempdir().expect("tempdir");
    let (store, queue) = setup(tmp.path());

    let spec = ScheduleSpec::Once { run_at: 2_000 };
    let task =
        create_task(&store, "tg:family", "call the dentist", &spec, false, 1_000).expect("create");

    let outcome = tick(&store, &queue, 2_500).expect("tick");
    assert_eq!(outcome.fired.len(), 1);

    let reloaded = store.load_task(&task.task_id).expect("load").expect("row");
    assert_eq!(reloaded.status, TaskStatus::Done);
    assert_eq!(reloaded.next_run_at, None);

    // Nothing fires on later ticks.
    let again = tick(&store, &queue, 9_000).expect("tick");
    assert!(again.fired.is_empty());
}

#[test]
fn backlog_after_downtime_collapses_to_one_wake() {
    let tmp = tempdir().expect("tempdir");
    let (store, queue) = setup(tmp.path());

    let spec = ScheduleSpec::Interval { every_ms: 60_000 };
    let task = create_task(&store, "tg:family", "check in", &spec, false, 1_000).expect("create");

    // Four hours of missed runs fire exactly once.
    let late = 1_000 + 4 * 3_600;
    let outcome = tick(&store, &queue, late).expect("tick");
    assert_eq!(outcome.fired.len(), 1);

    let claim = claim_oldest(&queue).expect("claim").expect("one wake");
    complete_wake(&claim).expect("complete");
    assert!(claim_oldest(&queue).expect("claim").is_none());

    let reloaded = store.load_task(&task.task_id).expect("load").expect("row");
    assert_eq!(reloaded.next_run_at, Some(late + 60));
}

#[test]
fn heartbeat_task_wakes_with_heartbeat_reason() {
    let tmp = tempdir().expect("tempdir");
    let (store, queue) = setup(tmp.path());

    let spec = ScheduleSpec::Interval { every_ms: 1_800_000 };
    let task = create_task(&store, "main", "anything worth flagging?", &spec, true, 0)
        .expect("create");

    tick(&store, &queue, 1_800).expect("tick");
    let claim = claim_oldest(&queue).expect("claim").expect("wake present");
    assert_eq!(
        claim.payload.reason,
        WakeReason::Heartbeat {
            task_id: task.task_id
        }
    );
}

#[test]
fn broken_schedule_pauses_only_the_broken_task() {
    let tmp = tempdir().expect("tempdir");
    let (store, queue) = setup(tmp.path());

    let healthy = create_task(
        &store,
        "tg:family",
        "healthy",
        &ScheduleSpec::Interval { every_ms: 60_000 },
        false,
        1_000,
    )
    .expect("create healthy");

    let mut broken = create_task(
        &store,
        "tg:family",
        "broken",
        &ScheduleSpec::Interval { every_ms: 60_000 },
        false,
        1_000,
    )
    .expect("create broken");
    broken.schedule_json = "{\"type\":\"cron\",\"expression\":\"not a cron\",\"timezone\":\"UTC\"}"
        .to_string();
    store.upsert_task(&broken).expect("corrupt row");

    let outcome = tick(&store, &queue, 1_060).expect("tick");
    assert_eq!(outcome.fired.len(), 1);
    assert_eq!(outcome.fired[0].task_id, healthy.task_id);
    assert_eq!(outcome.disabled.len(), 1);
    assert_eq!(outcome.disabled[0].task_id, broken.task_id);

    let paused = store.load_task(&broken.task_id).expect("load").expect("row");
    assert_eq!(paused.status, TaskStatus::Paused);
}

#[test]
fn cron_next_run_lands_on_the_next_quarter_hour() {
    let spec = ScheduleSpec::Cron {
        expression: "*/15 * * * *".to_string(),
        timezone: "UTC".to_string(),
    };
    // 2026-01-05 10:07:00 UTC.
    let base = 1_767_607_620;
    let next = compute_next_run_at(&spec, base, None)
        .expect("compute")
        .expect("has next");
    // 10:15:00 UTC the same morning.
    assert_eq!(next, 1_767_608_100);
}
