pub mod admission_worker;
pub mod ipc_worker;
pub mod logging;
pub mod ownership_lock;
pub mod scheduler_worker;
pub mod state_paths;
pub mod supervisor;
pub mod worker_registry;
pub mod workers;

pub use crate::shared::errors::RuntimeError;
pub use logging::{append_runtime_log, append_security_log};
pub use ownership_lock::{
    cleanup_stale_host, clear_start_lock, host_ownership_state, is_process_alive,
    reserve_start_lock, signal_stop, spawn_host_process, stop_active_host, write_host_lock_pid,
    OwnershipState, StopResult,
};
pub use state_paths::{
    bootstrap_state_root, default_state_root_path, StatePaths, DEFAULT_STATE_ROOT_DIR,
};
pub use supervisor::{
    load_supervisor_state, run_supervisor, save_supervisor_state, SupervisorState,
};
pub use worker_registry::{WorkerEvent, WorkerHealth, WorkerState};
pub use workers::WorkerRunContext;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(
                required.is_dir(),
                "missing directory: {}",
                required.display()
            );
        }
    }

    #[test]
    fn settings_file_lives_at_state_root() {
        let paths = StatePaths::new("/tmp/.wardend");
        assert_eq!(
            paths.settings_file(),
            PathBuf::from("/tmp/.wardend/config.yaml")
        );
        assert_eq!(
            paths.store_db_path(),
            PathBuf::from("/tmp/.wardend/store/host.db")
        );
    }

    #[test]
    fn stale_state_is_cleaned_when_pid_not_running() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".wardend"));
        bootstrap_state_root(&paths).expect("bootstrap");

        let stale = SupervisorState {
            running: true,
            pid: Some(999_999),
            started_at: Some(1),
            ..SupervisorState::default()
        };
        save_supervisor_state(&paths, &stale).expect("save stale");
        fs::write(paths.supervisor_lock_path(), "999999").expect("lock");

        let ownership = host_ownership_state(&paths).expect("ownership");
        assert_eq!(ownership, OwnershipState::Stale);

        cleanup_stale_host(&paths).expect("cleanup stale");
        assert_eq!(
            host_ownership_state(&paths).expect("ownership after"),
            OwnershipState::NotRunning
        );

        let cleaned = load_supervisor_state(&paths).expect("load cleaned");
        assert!(!cleaned.running);
        assert!(cleaned.pid.is_none());
    }

    #[test]
    fn reserve_start_lock_is_exclusive_until_cleared() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".wardend"));
        bootstrap_state_root(&paths).expect("bootstrap");

        reserve_start_lock(&paths).expect("reserve");
        let second = reserve_start_lock(&paths).expect_err("second reserve must fail");
        assert!(second.to_string().contains("failed to write lock file"));

        clear_start_lock(&paths);
        reserve_start_lock(&paths).expect("reserve after clear");
    }
}
