use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only JSON-line event log. Cloned freely into worker threads; every
/// append opens the file in append mode so concurrent writers interleave
/// whole lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    path: PathBuf,
    security_path: PathBuf,
    min_level: LogLevel,
}

impl EventLog {
    pub fn new(logs_dir: &Path, min_level: LogLevel) -> Self {
        Self {
            path: logs_dir.join("runtime.log"),
            security_path: logs_dir.join("security.log"),
            min_level,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn security_path(&self) -> &Path {
        &self.security_path
    }

    pub fn debug_enabled(&self) -> bool {
        self.min_level <= LogLevel::Debug
    }

    pub fn debug(&self, event: &str, message: &str) {
        self.append(LogLevel::Debug, event, message);
    }

    pub fn info(&self, event: &str, message: &str) {
        self.append(LogLevel::Info, event, message);
    }

    pub fn warn(&self, event: &str, message: &str) {
        self.append(LogLevel::Warn, event, message);
    }

    pub fn error(&self, event: &str, message: &str) {
        self.append(LogLevel::Error, event, message);
    }

    pub fn append(&self, level: LogLevel, event: &str, message: &str) {
        if level < self.min_level {
            return;
        }
        let payload = serde_json::json!({
            "timestamp": now_secs(),
            "level": level.as_str(),
            "event": event,
            "message": message,
        });
        append_json_line(&self.path, &payload);
    }

    /// Denied IPC requests. Always written, independent of the level filter,
    /// and mirrored into the runtime log as a warning.
    pub fn security(&self, event: &str, tenant: &str, detail: &str) {
        let payload = serde_json::json!({
            "timestamp": now_secs(),
            "event": event,
            "tenant": tenant,
            "detail": detail,
        });
        append_json_line(&self.security_path, &payload);
        self.warn(event, &format!("tenant={tenant} {detail}"));
    }
}

fn append_json_line(path: &Path, payload: &serde_json::Value) {
    let Ok(line) = serde_json::to_string(payload) else {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn level_filter_drops_debug_lines_at_info() {
        let dir = tempdir().expect("tempdir");
        let log = EventLog::new(dir.path(), LogLevel::Info);
        log.debug("noise", "hidden");
        log.info("host.started", "visible");

        let raw = fs::read_to_string(log.path()).expect("read log");
        assert!(!raw.contains("hidden"));
        assert!(raw.contains("\"event\":\"host.started\""));
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn security_events_land_in_both_logs() {
        let dir = tempdir().expect("tempdir");
        let log = EventLog::new(dir.path(), LogLevel::Error);
        log.security("ipc.message.denied", "family", "target chat not owned");

        let security = fs::read_to_string(log.security_path()).expect("security log");
        assert!(security.contains("\"tenant\":\"family\""));
        // warn mirror is filtered at error level
        assert!(!log.path().exists());
    }
}
