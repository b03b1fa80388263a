use wardend::commands::run_cli;

fn state_root_for(test: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    // Commands resolve the state root through the environment; point every
    // invocation in this binary at one throwaway root.
    std::env::set_var("WARDEND_STATE_ROOT", dir.path().join(test));
    dir
}

#[test]
fn help_lists_the_command_surface() {
    let output = run_cli(Vec::new()).expect("help");
    for needle in ["start", "stop", "status", "enqueue <group> <message>"] {
        assert!(output.contains(needle), "help is missing `{needle}`");
    }
    let explicit = run_cli(vec!["help".to_string()]).expect("help verb");
    assert_eq!(explicit, output);
}

#[test]
fn unknown_verb_and_bad_arity_fail_with_usage() {
    let err = run_cli(vec!["frobnicate".to_string()]).expect_err("unknown verb");
    assert!(err.contains("unknown command `frobnicate`"));

    let err = run_cli(vec!["__supervisor".to_string()]).expect_err("missing flag");
    assert_eq!(err, "usage: __supervisor --state-root <path>");
}

// Serialized into one test: these mutate the shared process environment.
#[test]
fn status_enqueue_and_stop_behave_on_a_fresh_state_root() {
    let _root = state_root_for("fresh");

    let status = run_cli(vec!["status".to_string()]).expect("status");
    assert!(status.contains("ownership=not_running"));
    assert!(status.contains("running=false"));

    // Enqueue requires two arguments and an approved group.
    let err = run_cli(vec!["enqueue".to_string()]).expect_err("arity");
    assert_eq!(err, "usage: enqueue <group> <message>");
    let err = run_cli(vec![
        "enqueue".to_string(),
        "tg:stranger".to_string(),
        "hello".to_string(),
    ])
    .expect_err("unapproved group");
    assert!(err.contains("unknown group"));

    // Stopping a host that was never started is not an error.
    let stopped = run_cli(vec!["stop".to_string()]).expect("stop");
    assert!(stopped.contains("running=false"));
}
