use super::host_lock::{acquire_host_lock, clear_stop_signal, release_host_lock};
use super::loops::{
    drain_inbox_once, drain_mailboxes, run_loop, tick_scheduler, INBOX_LOOP, MAILBOX_LOOP,
    SCHEDULER_LOOP,
};
use super::worker_primitives::LoopEvent;
use super::{bootstrap_state_root, HostContext, RuntimeError, StatePaths};
use crate::config::Settings;
use crate::gateway::ChatGateway;
use crate::inbox::{recover_processing_entries, InboxPaths};
use crate::ipc::recover_stale_claims;
use crate::shared::time::now_secs;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const SHUTDOWN_TIMEOUT_ENV: &str = "CLAWKEEPER_SHUTDOWN_TIMEOUT_SECONDS";
const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 5;

/// Runs the host in the foreground until a stop signal appears.
pub fn run_host(settings: &Settings) -> Result<(), RuntimeError> {
    let context = HostContext::open(settings)?;
    run_host_with_context(settings, context)
}

pub fn run_host_with_gateway(
    settings: &Settings,
    gateway: Arc<dyn ChatGateway>,
) -> Result<(), RuntimeError> {
    let context = HostContext::open_with_gateway(settings, gateway)?;
    run_host_with_context(settings, context)
}

fn run_host_with_context(settings: &Settings, context: HostContext) -> Result<(), RuntimeError> {
    let paths = context.paths.clone();
    bootstrap_state_root(&paths)?;
    acquire_host_lock(&paths)?;
    let outcome = supervise(settings, context);
    release_host_lock(&paths);
    clear_stop_signal(&paths);
    outcome
}

fn supervise(settings: &Settings, context: HostContext) -> Result<(), RuntimeError> {
    let paths = context.paths.clone();
    let log = context.log.clone();
    clear_stop_signal(&paths);

    context.register_main_tenant(settings, now_secs())?;
    recover_previous_run(&context, &paths)?;

    let context = Arc::new(context);
    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<LoopEvent>();
    let loops: [(&'static str, Duration); 3] = [
        (SCHEDULER_LOOP, settings.scheduler.interval()),
        (MAILBOX_LOOP, settings.ipc.interval()),
        (INBOX_LOOP, settings.inbox.interval()),
    ];

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut active = BTreeSet::new();
    for (loop_id, interval) in loops {
        let ctx = context.clone();
        let stop_flag = stop.clone();
        let tx = events_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("clawkeeper-{loop_id}"))
            .spawn(move || {
                run_loop(loop_id, interval, &stop_flag, &tx, || match loop_id {
                    SCHEDULER_LOOP => tick_scheduler(&ctx, now_secs()).map(|_| ()),
                    MAILBOX_LOOP => drain_mailboxes(&ctx, now_secs()).map(|_| ()),
                    _ => drain_inbox_once(&ctx).map(|_| ()),
                })
            });
        match spawned {
            Ok(handle) => {
                active.insert(loop_id);
                handles.push(handle);
            }
            Err(source) => {
                stop.store(true, Ordering::Relaxed);
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(RuntimeError::SpawnThread {
                    worker: loop_id.to_string(),
                    source,
                });
            }
        }
    }
    drop(events_tx);
    log.info(
        "host.started",
        &format!("pid={} loops={}", std::process::id(), active.len()),
    );

    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            log.info("host.stop.signal", "stop file detected");
        }
        match events_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => handle_loop_event(&context, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stop.store(true, Ordering::Relaxed);

    let deadline = Instant::now() + shutdown_wait_timeout();
    while !active.is_empty() && Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(event) => handle_loop_event(&context, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        // A loop is still inside a worker invocation. Kill the workers so the
        // loops can return, then wait for every loop.
        let terminated = context.runner.terminate_in_flight();
        log.warn(
            "host.shutdown.timeout",
            &format!(
                "loops still running: {} workers_terminated={terminated}",
                active.iter().copied().collect::<Vec<_>>().join(",")
            ),
        );
        while !active.is_empty() {
            match events_rx.recv() {
                Ok(event) => handle_loop_event(&context, &mut active, event),
                Err(_) => break,
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }

    log.info("host.stopped", "runtime stopped");
    Ok(())
}

fn recover_previous_run(context: &HostContext, paths: &StatePaths) -> Result<(), RuntimeError> {
    let quarantined = recover_stale_claims(&paths.ipc_dir(), &paths.ipc_errors_dir())?;
    for path in &quarantined {
        context.log.warn(
            "ipc.claim.stale",
            &format!("quarantined={}", path.display()),
        );
    }

    let recovered = recover_processing_entries(&InboxPaths::from_state_paths(paths))?;
    if !recovered.is_empty() {
        context
            .log
            .info("inbox.recovered", &format!("count={}", recovered.len()));
    }
    Ok(())
}

fn handle_loop_event(
    context: &HostContext,
    active: &mut BTreeSet<&'static str>,
    event: LoopEvent,
) {
    match event {
        LoopEvent::Started { loop_id, at } => {
            context
                .log
                .debug("host.loop.started", &format!("loop={loop_id} at={at}"));
        }
        LoopEvent::Error {
            loop_id,
            at,
            message,
        } => {
            context.log.error(
                "host.loop.error",
                &format!("loop={loop_id} at={at} error={message}"),
            );
        }
        LoopEvent::Stopped { loop_id, at } => {
            active.remove(loop_id);
            context
                .log
                .debug("host.loop.stopped", &format!("loop={loop_id} at={at}"));
        }
    }
}

pub fn shutdown_wait_timeout() -> Duration {
    let seconds = std::env::var(SHUTDOWN_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS);
    Duration::from_secs(seconds)
}
