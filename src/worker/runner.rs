use super::audit::{tail, write_audit_log, AuditOutcome, AuditRecord};
use super::capture::{capture_stream, CapturedStream};
use super::environment::{worker_environment, ENV_PROJECT_ROOT};
use super::live::{kill_process_group, LiveGuard, LiveWorkers};
use super::output_parse::parse_worker_output;
use super::{InvocationLog, WorkerError, WorkerInvocation, WorkerResult};
use crate::config::Settings;
use crate::runtime::StatePaths;
use crate::shared::time::now_secs;
use crate::shared::EventLog;
use crate::tenant::ensure_workspace;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STDERR_TAIL_CHARS: usize = 500;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Spawns worker processes for any tenant. Cheap to clone; clones share
/// one set of live workers.
#[derive(Debug, Clone)]
pub struct WorkerRunner {
    paths: StatePaths,
    binary: String,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
    verbose_audit: bool,
    project_root: Option<PathBuf>,
    live: LiveWorkers,
    log: EventLog,
}

impl WorkerRunner {
    pub fn new(paths: StatePaths, binary: impl Into<String>, log: EventLog) -> Self {
        Self {
            paths,
            binary: binary.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(crate::config::DEFAULT_WORKER_TIMEOUT_SECONDS),
            max_output_bytes: crate::config::DEFAULT_MAX_OUTPUT_BYTES,
            verbose_audit: false,
            project_root: None,
            live: LiveWorkers::new(),
            log,
        }
    }

    pub fn from_settings(settings: &Settings, paths: StatePaths, log: EventLog) -> Self {
        Self::new(paths, settings.worker.binary.clone(), log)
            .with_args(settings.worker.args.clone())
            .with_timeout(settings.worker_timeout())
            .with_max_output_bytes(settings.worker.max_output_bytes)
            .with_verbose_audit(settings.worker.verbose_audit)
            .with_project_root(settings.project_root.clone())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_verbose_audit(mut self, verbose_audit: bool) -> Self {
        self.verbose_audit = verbose_audit;
        self
    }

    pub fn with_project_root(mut self, project_root: Option<PathBuf>) -> Self {
        self.project_root = project_root;
        self
    }

    /// Kills the process group of every worker still running and refuses
    /// new spawns from then on. Returns how many workers were signalled.
    pub fn terminate_in_flight(&self) -> usize {
        self.live.terminate_all()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.live.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    /// Like [`WorkerRunner::run`], with every failure folded into an error
    /// result. Never panics or propagates across the worker boundary.
    pub fn invoke(&self, invocation: &WorkerInvocation) -> WorkerResult {
        match self.run(invocation) {
            Ok(result) => result,
            Err(err) => {
                self.log.error(
                    "worker.failed",
                    &format!("tenant={} kind={:?} error={err}", invocation.tenant_id, err.kind()),
                );
                WorkerResult::from_error(&err)
            }
        }
    }

    pub fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerResult, WorkerError> {
        let workspace = ensure_workspace(&self.paths, &invocation.tenant_id)?;
        let input = serde_json::to_string(invocation).map_err(|err| WorkerError::Filesystem {
            path: workspace.working_dir.display().to_string(),
            source: std::io::Error::other(err),
        })?;

        let started_at = now_secs();
        let mut base_log = InvocationLog {
            tenant_id: invocation.tenant_id.to_string(),
            binary: self.binary.clone(),
            working_directory: workspace.working_dir.clone(),
            started_at,
            duration_ms: 0,
            exit_code: None,
            timed_out: false,
            stdout_truncated: false,
            stderr_truncated: false,
        };

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .current_dir(&workspace.working_dir)
            .env_remove(ENV_PROJECT_ROOT)
            .envs(worker_environment(
                &workspace,
                invocation.is_privileged,
                self.project_root.as_deref(),
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            // Own process group, so a timeout also takes down anything the
            // worker spawned that still holds our pipes.
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                return Err(WorkerError::Spawn {
                    binary: self.binary.clone(),
                    source,
                    log: Box::new(base_log),
                })
            }
        };
        let pid = child.id();
        if !self.live.register(pid) {
            kill_worker(&mut child);
            let _ = child.wait();
            return Err(WorkerError::Spawn {
                binary: self.binary.clone(),
                source: std::io::Error::other("host is shutting down"),
                log: Box::new(base_log),
            });
        }
        let _live = LiveGuard::new(&self.live, pid);
        self.log.debug(
            "worker.spawned",
            &format!("tenant={} pid={pid}", invocation.tenant_id),
        );

        let streams = match self.attach_streams(&mut child, input.clone(), invocation) {
            Ok(streams) => streams,
            Err(err) => {
                kill_worker(&mut child);
                let _ = child.wait();
                return Err(err);
            }
        };

        // Draining the pipes counts against the same wall clock as the
        // process itself.
        let deadline = start + self.timeout;
        let exit = match wait_until(&mut child, deadline) {
            Ok(ExitOutcome::Exited(status)) if !streams.settle_by(deadline) => {
                self.log.warn(
                    "worker.pipes.lingering",
                    &format!("tenant={} pid={pid}", invocation.tenant_id),
                );
                kill_process_group(pid);
                Ok(ExitOutcome::TimedOut(Some(status)))
            }
            other => other,
        };

        // The process group is gone (or was killed); only now are the
        // captured buffers final.
        let (stdout, stderr) = streams.join_by(Instant::now() + PIPE_DRAIN_GRACE);
        base_log.duration_ms = start.elapsed().as_millis() as u64;
        base_log.stdout_truncated = stdout.truncated;
        base_log.stderr_truncated = stderr.truncated;
        if stdout.truncated || stderr.truncated {
            self.log.warn(
                "worker.output.truncated",
                &format!(
                    "tenant={} stdout_bytes={} stderr_bytes={} cap={}",
                    invocation.tenant_id,
                    stdout.total_bytes,
                    stderr.total_bytes,
                    self.max_output_bytes
                ),
            );
        }

        let stdout_text = stdout.text();
        let stderr_text = stderr.text();
        let status = match exit {
            Ok(ExitOutcome::Exited(status)) => status,
            Ok(ExitOutcome::TimedOut(status)) => {
                base_log.timed_out = true;
                base_log.exit_code = status.and_then(|s| s.code());
                self.audit(&base_log, AuditOutcome::TimedOut, &input, &stdout_text, &stderr_text);
                return Err(WorkerError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                    log: Box::new(base_log),
                });
            }
            Err(source) => {
                return Err(WorkerError::Filesystem {
                    path: workspace.working_dir.display().to_string(),
                    source,
                })
            }
        };

        base_log.exit_code = status.code();
        if !status.success() {
            self.audit(&base_log, AuditOutcome::Error, &input, &stdout_text, &stderr_text);
            return Err(WorkerError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
                stderr_tail: tail(stderr_text.trim_end(), STDERR_TAIL_CHARS),
                log: Box::new(base_log),
            });
        }

        match parse_worker_output(&stdout_text) {
            Ok(result) => {
                self.audit(&base_log, AuditOutcome::Success, &input, &stdout_text, &stderr_text);
                self.log.info(
                    "worker.completed",
                    &format!(
                        "tenant={} status={:?} duration_ms={}",
                        invocation.tenant_id, result.status, base_log.duration_ms
                    ),
                );
                Ok(result)
            }
            Err(reason) => {
                self.audit(&base_log, AuditOutcome::Error, &input, &stdout_text, &stderr_text);
                Err(WorkerError::OutputParse {
                    reason,
                    log: Box::new(base_log),
                })
            }
        }
    }

    fn attach_streams(
        &self,
        child: &mut Child,
        input: String,
        invocation: &WorkerInvocation,
    ) -> Result<AttachedStreams, WorkerError> {
        let pipe_err = |name: &str| WorkerError::Filesystem {
            path: format!("worker {name}"),
            source: std::io::Error::other(format!("missing {name} pipe")),
        };
        let mut stdin = child.stdin.take().ok_or_else(|| pipe_err("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_err("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_err("stderr"))?;

        // A worker that never reads stdin must not stall the host, so the
        // write happens off-thread. Dropping the handle closes the pipe.
        let writer = thread::spawn(move || {
            let _ = stdin.write_all(input.as_bytes());
            let _ = stdin.write_all(b"\n");
        });

        let cap = self.max_output_bytes;
        let stdout_reader = thread::spawn(move || capture_stream(stdout, cap, |_| {}));

        let log = self.log.clone();
        let tenant = invocation.tenant_id.to_string();
        let stderr_reader = thread::spawn(move || {
            let forward = log.debug_enabled();
            capture_stream(stderr, cap, |line| {
                if forward {
                    log.debug("worker.stderr", &format!("tenant={tenant} {line}"));
                }
            })
        });

        Ok(AttachedStreams {
            writer,
            stdout: stdout_reader,
            stderr: stderr_reader,
        })
    }

    fn audit(
        &self,
        log: &InvocationLog,
        outcome: AuditOutcome,
        input: &str,
        stdout: &str,
        stderr: &str,
    ) {
        let logs_dir = self
            .paths
            .groups_dir()
            .join(&log.tenant_id)
            .join("logs");
        let record = AuditRecord {
            log,
            outcome,
            input,
            stdout,
            stderr,
            verbose: self.verbose_audit,
        };
        if let Err(err) = write_audit_log(&logs_dir, &record) {
            self.log.warn(
                "worker.audit.failed",
                &format!("tenant={} error={err}", log.tenant_id),
            );
        }
    }
}

struct AttachedStreams {
    writer: JoinHandle<()>,
    stdout: JoinHandle<CapturedStream>,
    stderr: JoinHandle<CapturedStream>,
}

impl AttachedStreams {
    fn is_finished(&self) -> bool {
        self.writer.is_finished() && self.stdout.is_finished() && self.stderr.is_finished()
    }

    /// Waits for every pipe to reach EOF. False if `deadline` passes first.
    fn settle_by(&self, deadline: Instant) -> bool {
        loop {
            if self.is_finished() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Joins the pipe threads, or abandons them with empty captures when a
    /// pipe is still held open at `deadline`.
    fn join_by(self, deadline: Instant) -> (CapturedStream, CapturedStream) {
        if !self.settle_by(deadline) {
            return (CapturedStream::default(), CapturedStream::default());
        }
        let _ = self.writer.join();
        let stdout = self.stdout.join().unwrap_or_default();
        let stderr = self.stderr.join().unwrap_or_default();
        (stdout, stderr)
    }
}

enum ExitOutcome {
    Exited(ExitStatus),
    TimedOut(Option<ExitStatus>),
}

/// Polls for exit until `deadline`, then kills and reaps the child.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<ExitOutcome> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(ExitOutcome::Exited(status)),
            Ok(None) => {}
            Err(err) => {
                kill_worker(child);
                let _ = child.wait();
                return Err(err);
            }
        }
        if Instant::now() >= deadline {
            kill_worker(child);
            let status = child.wait().ok();
            return Ok(ExitOutcome::TimedOut(status));
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn kill_worker(child: &mut Child) {
    kill_process_group(child.id());
    let _ = child.kill();
}
