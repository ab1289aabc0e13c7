#![cfg(unix)]

use clawkeeper::runtime::{is_process_alive, StatePaths};
use clawkeeper::shared::{EventLog, LogLevel, TenantId};
use clawkeeper::tenant::Tenant;
use clawkeeper::worker::{
    WorkerError, WorkerInvocation, WorkerRunner, WorkerStatus, OUTPUT_END_MARKER,
    OUTPUT_START_MARKER,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn tenant(id: &str, privileged: bool) -> Tenant {
    Tenant {
        id: TenantId::parse(id).expect("tenant id"),
        name: id.to_string(),
        chat_target: format!("{id}@g.us"),
        is_privileged: privileged,
    }
}

struct Fixture {
    dir: TempDir,
    paths: StatePaths,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join("state"));
        Self { dir, paths }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        write_script(&path, body);
        path
    }

    fn runner(&self, binary: &Path) -> WorkerRunner {
        let log = EventLog::new(&self.paths.logs_dir(), LogLevel::Debug);
        WorkerRunner::new(self.paths.clone(), binary.display().to_string(), log)
            .with_timeout(Duration::from_secs(10))
    }

    fn audit_logs(&self, tenant: &str) -> Vec<String> {
        let dir = self.paths.groups_dir().join(tenant).join("logs");
        let mut logs = fs::read_dir(dir)
            .expect("logs dir")
            .map(|entry| fs::read_to_string(entry.expect("entry").path()).expect("read log"))
            .collect::<Vec<_>>();
        logs.sort();
        logs
    }
}

#[test]
fn sentinel_result_is_extracted_and_input_reaches_worker() {
    let fixture = Fixture::new();
    let body = format!(
        "#!/bin/sh\ncat > input.json\necho \"$CLAWKEEPER_TENANT_ID\" > tenant.txt\n\
         echo 'loading tools'\necho '{OUTPUT_START_MARKER}'\n\
         echo '{{\"status\":\"success\",\"result\":\"hi there\",\"newSessionId\":\"s-2\"}}'\n\
         echo '{OUTPUT_END_MARKER}'\necho 'bye'\n"
    );
    let worker = fixture.script("worker.sh", &body);

    let family = tenant("family", false);
    let invocation =
        WorkerInvocation::for_tenant(&family, "what's for dinner").with_session(Some("s-1".into()));
    let result = fixture.runner(&worker).run(&invocation).expect("run");

    assert_eq!(result.status, WorkerStatus::Success);
    assert_eq!(result.result.as_deref(), Some("hi there"));
    assert_eq!(result.new_session_id.as_deref(), Some("s-2"));

    let workdir = fixture.paths.groups_dir().join("family");
    let input: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(workdir.join("input.json")).expect("input"))
            .expect("input json");
    assert_eq!(input["prompt"], "what's for dinner");
    assert_eq!(input["sessionId"], "s-1");
    assert_eq!(input["tenantId"], "family");
    assert_eq!(input["isPrivileged"], false);
    assert!(input.get("isScheduledTask").is_none());
    assert_eq!(
        fs::read_to_string(workdir.join("tenant.txt")).expect("tenant").trim(),
        "family"
    );

    let logs = fixture.audit_logs("family");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("outcome: success"));
    assert!(logs[0].contains("exit_code: 0"));
}

#[test]
fn worker_that_never_exits_is_killed_at_the_timeout() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "hang.sh",
        "#!/bin/sh\necho $$ > pid.txt\nexec sleep 30\n",
    );
    let family = tenant("family", false);

    let start = Instant::now();
    let err = fixture
        .runner(&worker)
        .with_timeout(Duration::from_millis(300))
        .run(&WorkerInvocation::for_tenant(&family, "loop forever"))
        .expect_err("timeout");
    assert!(start.elapsed() < Duration::from_secs(10));

    match &err {
        WorkerError::Timeout { timeout_ms, log } => {
            assert_eq!(*timeout_ms, 300);
            assert!(log.timed_out);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let pid: u32 = fs::read_to_string(fixture.paths.groups_dir().join("family/pid.txt"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    assert!(!is_process_alive(pid), "worker {pid} survived the timeout");
    assert!(fixture.audit_logs("family")[0].contains("outcome: timed_out"));
}

/// Gone, or a zombie nobody has reaped yet.
fn process_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) if Path::new("/proc/self/stat").exists() => true,
        Err(_) => !is_process_alive(pid),
    }
}

#[test]
fn worker_exit_with_lingering_child_is_bounded_by_timeout() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "detach.sh",
        "#!/bin/sh\ncat >/dev/null\nsleep 30 &\necho $! > bg.pid\n\
         echo '{\"status\":\"success\",\"result\":\"ok\"}'\nexit 0\n",
    );
    let family = tenant("family", false);

    let start = Instant::now();
    let err = fixture
        .runner(&worker)
        .with_timeout(Duration::from_secs(1))
        .run(&WorkerInvocation::for_tenant(&family, "leave something behind"))
        .expect_err("held pipes count against the timeout");
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "took {:?}",
        start.elapsed()
    );
    match &err {
        WorkerError::Timeout { timeout_ms, log } => {
            assert_eq!(*timeout_ms, 1000);
            assert!(log.timed_out);
            assert_eq!(log.exit_code, Some(0));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let pid: u32 = fs::read_to_string(fixture.paths.groups_dir().join("family/bg.pid"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    let deadline = Instant::now() + Duration::from_secs(3);
    while !process_gone(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(process_gone(pid), "background child {pid} outlived the worker");
    assert!(fixture.audit_logs("family")[0].contains("outcome: timed_out"));
}

#[test]
fn timeout_surfaces_as_error_result_through_invoke() {
    let fixture = Fixture::new();
    let worker = fixture.script("hang.sh", "#!/bin/sh\nexec sleep 30\n");
    let result = fixture
        .runner(&worker)
        .with_timeout(Duration::from_millis(200))
        .invoke(&WorkerInvocation::for_tenant(&tenant("family", false), "x"));
    assert_eq!(result.status, WorkerStatus::Error);
    assert!(result.result.is_none());
    assert!(result.error.as_deref().unwrap_or("").contains("timed out"));
}

#[test]
fn oversized_output_is_capped_without_killing_the_worker() {
    let fixture = Fixture::new();
    let body = format!(
        "#!/bin/sh\necho '{OUTPUT_START_MARKER}'\necho '{{\"status\":\"success\",\"result\":\"done\"}}'\n\
         echo '{OUTPUT_END_MARKER}'\nhead -c 300000 /dev/zero | tr '\\0' 'e' >&2\nexit 0\n"
    );
    let worker = fixture.script("noisy.sh", &body);

    let result = fixture
        .runner(&worker)
        .with_max_output_bytes(4096)
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect("worker still succeeds");
    assert_eq!(result.result.as_deref(), Some("done"));

    let log = &fixture.audit_logs("family")[0];
    assert!(log.contains("stderr_truncated: true"));
    assert!(log.contains("stdout_truncated: false"));
}

#[test]
fn truncated_stdout_without_result_is_a_parse_error() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "flood.sh",
        "#!/bin/sh\nhead -c 200000 /dev/zero | tr '\\0' 'x'\necho\necho '{\"status\":\"success\",\"result\":\"late\"}'\n",
    );

    let err = fixture
        .runner(&worker)
        .with_max_output_bytes(1024)
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect_err("parse error");
    match err {
        WorkerError::OutputParse { log, .. } => {
            assert!(log.stdout_truncated);
            assert_eq!(log.exit_code, Some(0));
            assert!(!log.timed_out);
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn last_line_fallback_when_markers_are_missing() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "plain.sh",
        "#!/bin/sh\necho 'thinking...'\necho '{\"status\":\"success\",\"result\":\"plain\"}'\necho\n",
    );
    let result = fixture
        .runner(&worker)
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect("run");
    assert_eq!(result.result.as_deref(), Some("plain"));
}

#[test]
fn missing_binary_is_a_spawn_error() {
    let fixture = Fixture::new();
    let missing = fixture.dir.path().join("does-not-exist");
    let err = fixture
        .runner(&missing)
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect_err("spawn error");
    assert!(matches!(err, WorkerError::Spawn { .. }), "{err:?}");
    assert!(err.log().is_some_and(|log| log.exit_code.is_none()));
}

#[test]
fn non_zero_exit_carries_stderr_tail() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "fail.sh",
        "#!/bin/sh\necho 'model quota exceeded' >&2\nexit 3\n",
    );
    let err = fixture
        .runner(&worker)
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect_err("exit error");
    match err {
        WorkerError::NonZeroExit {
            exit_code,
            stderr_tail,
            ..
        } => {
            assert_eq!(exit_code, 3);
            assert!(stderr_tail.contains("model quota exceeded"));
        }
        other => panic!("expected non-zero exit, got {other:?}"),
    }
    let log = &fixture.audit_logs("family")[0];
    assert!(log.contains("=== stderr ===\nmodel quota exceeded"));
}

#[test]
fn project_root_is_only_exposed_to_the_privileged_tenant() {
    let fixture = Fixture::new();
    let worker = fixture.script(
        "env.sh",
        "#!/bin/sh\nprintf '%s' \"${CLAWKEEPER_PROJECT_ROOT:-none}\" > root.txt\n\
         echo '{\"status\":\"success\",\"result\":null}'\n",
    );
    let runner = fixture
        .runner(&worker)
        .with_project_root(Some(PathBuf::from("/srv/project")));

    runner
        .run(&WorkerInvocation::for_tenant(&tenant("main", true), "x"))
        .expect("main run");
    runner
        .run(&WorkerInvocation::for_tenant(&tenant("family", false), "x"))
        .expect("family run");

    let read = |id: &str| {
        fs::read_to_string(fixture.paths.groups_dir().join(id).join("root.txt")).expect("root")
    };
    assert_eq!(read("main"), "/srv/project");
    assert_eq!(read("family"), "none");
}
