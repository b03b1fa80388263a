use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use wardend::config::{AgentRuntimeSettings, Limits, SchedulerSettings, Settings};
use wardend::queue::{WakeReason, WakeRequest};
use wardend::session::{Admission, SessionManager};
use wardend::store::{ContactStatus, GroupRecord, HostStore};

struct Harness {
    _temp: TempDir,
    manager: SessionManager,
    store: HostStore,
    state_root: std::path::PathBuf,
}

fn write_agent_script(dir: &Path, body: &str) -> String {
    let path = dir.join("agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    path.display().to_string()
}

fn harness(script_body: &str, limits: Limits) -> Harness {
    let temp = tempdir().expect("tempdir");
    let state_root = temp.path().join("state");
    let workspaces = temp.path().join("workspaces");
    fs::create_dir_all(&state_root).expect("state root");
    fs::create_dir_all(&workspaces).expect("workspaces");

    let allowlist_path = temp.path().join("allowlist.json");
    fs::write(
        &allowlist_path,
        r#"{"allowedRoots":[],"blockedPatterns":[],"nonMainReadOnly":false}"#,
    )
    .expect("allowlist");

    let binary = write_agent_script(temp.path(), script_body);
    let settings = Settings {
        workspaces_path: workspaces,
        allowlist_path,
        main_group_id: "main".to_string(),
        groups: BTreeMap::new(),
        limits,
        agent_runtime: AgentRuntimeSettings {
            binary,
            args: Vec::new(),
            env: BTreeMap::new(),
        },
        scheduler: SchedulerSettings::default(),
        heartbeat: None,
    };

    let store = HostStore::open(&state_root.join("host.db")).expect("open store");
    let manager = SessionManager::new(settings, store.clone(), &state_root);
    Harness {
        _temp: temp,
        manager,
        store,
        state_root,
    }
}

fn group(group_id: &str) -> GroupRecord {
    GroupRecord {
        group_id: group_id.to_string(),
        display_name: group_id.to_string(),
        workspace_folder: group_id.replace(':', "_"),
        requires_trigger: false,
        contact_status: ContactStatus::Approved,
        mounts: Vec::new(),
        created_at: 1,
    }
}

fn wake(group_id: &str, message: &str) -> WakeRequest {
    WakeRequest {
        wake_id: format!("wake-{message}"),
        group_id: group_id.to_string(),
        reason: WakeReason::Inbound,
        message: message.to_string(),
        sender: Some("tester".to_string()),
        enqueued_at: 1,
    }
}

fn wait_for_checkpoint(store: &HostStore, group_id: &str) -> wardend::store::SessionCheckpoint {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(checkpoint) = store.load_checkpoint(group_id).expect("load checkpoint") {
            return checkpoint;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("no checkpoint recorded for {group_id}");
}

fn wait_until_not_live(manager: &SessionManager, group_id: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !manager.is_live(group_id) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("session for {group_id} never terminated");
}

#[test]
fn graceful_exit_records_checkpoint_with_last_wake() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 10_000,
        hard_timeout_ms: 30_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("exit 0", limits);

    let admission = h
        .manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "hello"))
        .expect("admit");
    assert!(matches!(admission, Admission::Spawned { .. }));

    let checkpoint = wait_for_checkpoint(&h.store, "tg:family");
    assert_eq!(checkpoint.exit_reason, "graceful_exit");
    assert_eq!(checkpoint.last_wake_id.as_deref(), Some("wake-hello"));
    wait_until_not_live(&h.manager, "tg:family");
}

#[test]
fn idle_session_is_drained_with_idle_timeout_reason() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 200,
        hard_timeout_ms: 30_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("sleep 30", limits);

    h.manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "hello"))
        .expect("admit");

    let checkpoint = wait_for_checkpoint(&h.store, "tg:family");
    assert_eq!(checkpoint.exit_reason, "idle_timeout");
    wait_until_not_live(&h.manager, "tg:family");
}

#[test]
fn second_wake_for_live_group_is_delivered_not_spawned() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 30_000,
        hard_timeout_ms: 60_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("sleep 30", limits);
    let record = group("tg:family");

    let first = h
        .manager
        .admit_wake(&record, &wake("tg:family", "one"))
        .expect("admit first");
    let Admission::Spawned { session_id } = first else {
        panic!("expected spawn, got {first:?}");
    };

    let second = h
        .manager
        .admit_wake(&record, &wake("tg:family", "two"))
        .expect("admit second");
    assert_eq!(
        second,
        Admission::Delivered {
            session_id: session_id.clone()
        }
    );
    assert_eq!(h.manager.live_count(), 1);

    // Both wakes landed in the same input mailbox.
    let input_dir = wardend::ipc::SessionMailbox::for_group(&h.state_root, "tg:family").input;
    let delivered = fs::read_dir(&input_dir)
        .expect("input dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    assert_eq!(delivered, 2);

    h.manager.shutdown(Duration::from_secs(5));
}

#[test]
fn concurrent_wakes_for_one_group_spawn_a_single_session() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 30_000,
        hard_timeout_ms: 60_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("sleep 30", limits);
    let record = group("tg:family");

    let admissions: Vec<Admission> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = &h.manager;
                let record = &record;
                scope.spawn(move || {
                    manager
                        .admit_wake(record, &wake("tg:family", &format!("m{i}")))
                        .expect("admit")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });

    let spawned = admissions
        .iter()
        .filter(|a| matches!(a, Admission::Spawned { .. }))
        .count();
    assert_eq!(spawned, 1, "admissions: {admissions:?}");
    assert!(admissions.iter().all(|a| matches!(
        a,
        Admission::Spawned { .. } | Admission::Delivered { .. } | Admission::Busy
    )));
    assert_eq!(h.manager.live_count(), 1);

    h.manager.shutdown(Duration::from_secs(5));
}

#[test]
fn global_cap_reports_capacity_for_other_groups() {
    let limits = Limits {
        max_concurrent_sessions: 1,
        idle_timeout_ms: 30_000,
        hard_timeout_ms: 60_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("sleep 30", limits);

    let first = h
        .manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "one"))
        .expect("admit first");
    assert!(matches!(first, Admission::Spawned { .. }));

    let second = h
        .manager
        .admit_wake(&group("tg:work"), &wake("tg:work", "two"))
        .expect("admit second");
    assert_eq!(second, Admission::Capacity);

    h.manager.shutdown(Duration::from_secs(5));
}

#[test]
fn crash_exit_writes_checkpoint_and_crash_notice() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 10_000,
        hard_timeout_ms: 30_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("exit 3", limits);

    h.manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "boom"))
        .expect("admit");

    let checkpoint = wait_for_checkpoint(&h.store, "tg:family");
    assert_eq!(checkpoint.exit_reason, "crashed");
    wait_until_not_live(&h.manager, "tg:family");

    let pending = wardend::channels::list_outbound(&h.state_root).expect("outbox");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.group_id, "tg:family");
    assert_eq!(pending[0].1.kind, wardend::channels::OutboundKind::CrashNotice);
}

#[test]
fn continuity_marker_from_workspace_survives_in_checkpoint() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 10_000,
        hard_timeout_ms: 30_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("printf 'resume-here' > .continuity\nexit 0", limits);

    h.manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "hello"))
        .expect("admit");

    let checkpoint = wait_for_checkpoint(&h.store, "tg:family");
    assert_eq!(checkpoint.continuity_marker.as_deref(), Some("resume-here"));
}

#[test]
fn approved_mounts_are_materialized_and_denied_mounts_block_spawn() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 10_000,
        hard_timeout_ms: 30_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("exit 0", limits);

    let shared = h._temp.path().join("shared");
    fs::create_dir_all(&shared).expect("shared dir");
    fs::write(
        h._temp.path().join("allowlist.json"),
        format!(
            r#"{{"allowedRoots":[{{"path":"{}","allowReadWrite":true}}],"blockedPatterns":[],"nonMainReadOnly":false}}"#,
            shared.display()
        ),
    )
    .expect("rewrite allowlist");

    let mut record = group("tg:family");
    record.mounts = vec![wardend::config::MountSpec {
        host_path: shared.clone(),
        container_path: "/mnt/shared".to_string(),
        read_write: true,
    }];

    let admission = h
        .manager
        .admit_wake(&record, &wake("tg:family", "hello"))
        .expect("admit");
    assert!(matches!(admission, Admission::Spawned { .. }));
    wait_for_checkpoint(&h.store, "tg:family");

    let workspace = h._temp.path().join("workspaces/tg_family");
    let link = workspace.join("mnt/shared");
    assert_eq!(
        fs::read_link(&link).expect("mount symlink"),
        fs::canonicalize(&shared).expect("canonical shared")
    );
    let manifest = fs::read_to_string(workspace.join("mounts.json")).expect("manifest");
    assert!(manifest.contains("\"readWrite\": true") || manifest.contains("\"readWrite\":true"));

    // A mount outside every allowed root blocks the spawn entirely.
    wait_until_not_live(&h.manager, "tg:family");
    let mut outside = group("tg:work");
    outside.mounts = vec![wardend::config::MountSpec {
        host_path: h._temp.path().join("not-allowed"),
        container_path: "/mnt/secrets".to_string(),
        read_write: false,
    }];
    fs::create_dir_all(h._temp.path().join("not-allowed")).expect("dir");
    let err = h
        .manager
        .admit_wake(&outside, &wake("tg:work", "nope"))
        .expect_err("must deny");
    assert!(matches!(
        err,
        wardend::session::SessionError::Mount(_)
    ));
    assert!(!h.manager.is_live("tg:work"));
}

#[test]
fn shutdown_lets_a_trapping_agent_exit_cleanly() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 30_000,
        hard_timeout_ms: 60_000,
        output_cap_bytes: 1_048_576,
    };
    // The agent writes its continuity marker from a TERM trap; the marker
    // can only exist if the drain sent a catchable signal before killing.
    let h = harness(
        "trap 'printf clean-exit > .continuity; exit 0' TERM\nsleep 30 &\nwait $!",
        limits,
    );

    h.manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "hello"))
        .expect("admit");
    // Give the shell a moment to install the trap.
    std::thread::sleep(Duration::from_millis(300));

    let still_alive = h.manager.shutdown(Duration::from_secs(10));
    assert_eq!(still_alive, 0);

    let checkpoint = wait_for_checkpoint(&h.store, "tg:family");
    assert_eq!(checkpoint.exit_reason, "shutdown");
    assert_eq!(checkpoint.continuity_marker.as_deref(), Some("clean-exit"));
}

#[test]
fn shutdown_drains_every_live_session() {
    let limits = Limits {
        max_concurrent_sessions: 4,
        idle_timeout_ms: 30_000,
        hard_timeout_ms: 60_000,
        output_cap_bytes: 1_048_576,
    };
    let h = harness("sleep 30", limits);

    h.manager
        .admit_wake(&group("tg:family"), &wake("tg:family", "one"))
        .expect("admit family");
    h.manager
        .admit_wake(&group("tg:work"), &wake("tg:work", "two"))
        .expect("admit work");
    assert_eq!(h.manager.live_count(), 2);

    let still_alive = h.manager.shutdown(Duration::from_secs(10));
    assert_eq!(still_alive, 0);
    assert_eq!(h.manager.live_count(), 0);

    let family = h.store.load_checkpoint("tg:family").expect("load").expect("present");
    assert_eq!(family.exit_reason, "shutdown");
}
