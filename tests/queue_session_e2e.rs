use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use wardend::channels::submit_inbound;
use wardend::config::{AgentRuntimeSettings, Limits, SchedulerSettings, Settings};
use wardend::groups::approve_contact;
use wardend::ipc::{collect_output_files, OutputFile, SessionMailbox, TaskPayload};
use wardend::queue::{claim_oldest, complete_wake, QueuePaths};
use wardend::session::{Admission, SessionManager};
use wardend::store::HostStore;

// The agent stand-in copies its first input message into a send_message task
// file, exercising both mailbox directions through the real env contract.
const AGENT_BODY: &str = r#"
first=$(ls "$WARDEND_INPUT_DIR"/*.json | head -n 1)
test -n "$first" || exit 3
cat > "$WARDEND_OUTPUT_DIR/.reply.json.tmp" <<EOF
{"type":"send_message","sourceGroupId":"$WARDEND_GROUP_ID","createdAt":1,"to":"tg:family","message":"handled"}
EOF
mv "$WARDEND_OUTPUT_DIR/.reply.json.tmp" "$WARDEND_OUTPUT_DIR/reply-1.json"
exit 0
"#;

fn write_agent_script(dir: &Path) -> String {
    let path = dir.join("agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{AGENT_BODY}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    path.display().to_string()
}

#[test]
fn inbound_message_flows_queue_to_session_to_output_task() {
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

    let settings = Settings {
        workspaces_path: workspaces,
        allowlist_path,
        main_group_id: "main".to_string(),
        groups: BTreeMap::new(),
        limits: Limits {
            max_concurrent_sessions: 4,
            idle_timeout_ms: 10_000,
            hard_timeout_ms: 30_000,
            output_cap_bytes: 1_048_576,
        },
        agent_runtime: AgentRuntimeSettings {
            binary: write_agent_script(temp.path()),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
        scheduler: SchedulerSettings::default(),
        heartbeat: None,
    };

    let store = HostStore::open(&state_root.join("host.db")).expect("open store");
    approve_contact(&store, "tg:family", "Family", 1).expect("approve");

    let queue = QueuePaths::from_state_root(&state_root);
    queue.bootstrap().expect("bootstrap queue");

    // Channel adapter side: enqueue and return immediately.
    let wake = submit_inbound(&store, &queue, "tg:family", "alice", "please handle this", 100)
        .expect("enqueue");

    // Admission side: claim the wake and spawn a session for it.
    let claim = claim_oldest(&queue).expect("claim").expect("wake present");
    assert_eq!(claim.payload, wake);

    let manager = SessionManager::new(settings, store.clone(), &state_root);
    let group = store
        .load_group("tg:family")
        .expect("load group")
        .expect("approved group exists");
    let admission = manager.admit_wake(&group, &claim.payload).expect("admit");
    assert!(matches!(admission, Admission::Spawned { .. }));
    complete_wake(&claim).expect("complete");

    // The session terminates gracefully after writing its reply.
    let deadline = Instant::now() + Duration::from_secs(10);
    let checkpoint = loop {
        if let Some(checkpoint) = store.load_checkpoint("tg:family").expect("load checkpoint") {
            break checkpoint;
        }
        assert!(Instant::now() < deadline, "session never checkpointed");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(checkpoint.exit_reason, "graceful_exit");
    assert_eq!(checkpoint.last_wake_id, Some(wake.wake_id));

    // IPC side: the reply task is collectable and well formed.
    let mailbox = SessionMailbox::for_group(&state_root, "tg:family");
    let files = collect_output_files(&mailbox).expect("collect");
    assert_eq!(files.len(), 1);
    let OutputFile::Task(task) = &files[0] else {
        panic!("expected a parsed task");
    };
    assert_eq!(task.envelope.source_group_id, "tg:family");
    assert!(matches!(
        task.envelope.payload,
        TaskPayload::SendMessage { .. }
    ));

    // The mount manifest was materialized even with an empty mount set.
    let manifest = temp
        .path()
        .join("workspaces")
        .join(&group.workspace_folder)
        .join("mounts.json");
    assert!(manifest.is_file());
}
