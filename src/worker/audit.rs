use super::InvocationLog;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::random_base36;
use crate::shared::time::{format_rfc3339, now_millis};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Error,
    TimedOut,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug)]
pub struct AuditRecord<'a> {
    pub log: &'a InvocationLog,
    pub outcome: AuditOutcome,
    pub input: &'a str,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub verbose: bool,
}

/// Writes `worker-{ms}-{suffix}.log` into the tenant's log directory and
/// returns its path.
pub fn write_audit_log(logs_dir: &Path, record: &AuditRecord<'_>) -> std::io::Result<PathBuf> {
    fs::create_dir_all(logs_dir)?;
    let suffix = random_base36(4).map_err(std::io::Error::other)?;
    let path = logs_dir.join(format!("worker-{}-{suffix}.log", now_millis()));
    atomic_write_file(&path, render(record).as_bytes())?;
    Ok(path)
}

pub fn render(record: &AuditRecord<'_>) -> String {
    let log = record.log;
    let mut out = String::new();
    let _ = writeln!(out, "=== Worker Run ===");
    let _ = writeln!(out, "timestamp: {}", format_rfc3339(log.started_at));
    let _ = writeln!(out, "tenant: {}", log.tenant_id);
    let _ = writeln!(out, "binary: {}", log.binary);
    let _ = writeln!(out, "working_directory: {}", log.working_directory.display());
    let _ = writeln!(out, "outcome: {}", record.outcome.as_str());
    let _ = writeln!(out, "duration_ms: {}", log.duration_ms);
    let _ = writeln!(
        out,
        "exit_code: {}",
        log.exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    let _ = writeln!(out, "timed_out: {}", log.timed_out);
    let _ = writeln!(out, "stdout_truncated: {}", log.stdout_truncated);
    let _ = writeln!(out, "stderr_truncated: {}", log.stderr_truncated);

    // Failures always get the full picture.
    if record.verbose || record.outcome != AuditOutcome::Success {
        section(&mut out, "input", record.input);
        section(&mut out, "stderr", record.stderr);
        section(&mut out, "stdout", record.stdout);
    } else {
        let _ = writeln!(out, "input_chars: {}", record.input.chars().count());
        section(&mut out, "stderr (tail)", &tail(record.stderr, EXCERPT_CHARS));
        section(&mut out, "stdout (tail)", &tail(record.stdout, EXCERPT_CHARS));
    }
    out
}

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out, "\n=== {title} ===");
    let _ = writeln!(out, "{}", body.trim_end());
}

pub fn tail(raw: &str, max_chars: usize) -> String {
    let count = raw.chars().count();
    if count <= max_chars {
        return raw.to_string();
    }
    raw.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> InvocationLog {
        InvocationLog {
            tenant_id: "family".to_string(),
            binary: "agent".to_string(),
            working_directory: PathBuf::from("/state/groups/family"),
            started_at: 1_704_067_200,
            duration_ms: 42,
            exit_code: Some(0),
            timed_out: false,
            stdout_truncated: true,
            stderr_truncated: false,
        }
    }

    #[test]
    fn quiet_success_keeps_only_excerpts() {
        let long_stdout = format!("{}END", "a".repeat(2000));
        let invocation_log = log();
        let text = render(&AuditRecord {
            log: &invocation_log,
            outcome: AuditOutcome::Success,
            input: "secret prompt",
            stdout: &long_stdout,
            stderr: "warn",
            verbose: false,
        });
        assert!(text.contains("tenant: family"));
        assert!(text.contains("stdout_truncated: true"));
        assert!(text.contains("input_chars: 13"));
        assert!(!text.contains("secret prompt"));
        assert!(text.contains("END"));
        assert!(!text.contains(&"a".repeat(600)));
    }

    #[test]
    fn errors_are_logged_in_full() {
        let invocation_log = log();
        let text = render(&AuditRecord {
            log: &invocation_log,
            outcome: AuditOutcome::Error,
            input: "secret prompt",
            stdout: "",
            stderr: "boom",
            verbose: false,
        });
        assert!(text.contains("=== input ===\nsecret prompt"));
        assert!(text.contains("outcome: error"));
    }

    #[test]
    fn write_places_file_in_logs_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invocation_log = log();
        let path = write_audit_log(
            &dir.path().join("logs"),
            &AuditRecord {
                log: &invocation_log,
                outcome: AuditOutcome::TimedOut,
                input: "{}",
                stdout: "",
                stderr: "",
                verbose: true,
            },
        )
        .expect("write");
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("worker-") && name.ends_with(".log"));
        assert!(fs::read_to_string(&path).expect("read").contains("timed_out"));
    }
}
