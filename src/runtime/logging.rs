use super::StatePaths;
use crate::shared::time::now_secs;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Append one JSONL record to the runtime log. Logging never fails the
/// caller; a broken log file must not take the host down.
pub fn append_runtime_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    append_log_record(&paths.runtime_log_path(), level, event, message);
}

/// Authorization rejections go to a dedicated log so they survive runtime
/// log rotation and are easy to audit.
pub fn append_security_log(paths: &StatePaths, event: &str, message: &str) {
    append_log_record(&paths.security_log_path(), "warn", event, message);
}

fn append_log_record(path: &Path, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": now_secs(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}
