use super::turn::{run_agent_turn, ScheduledTurns, TurnKind};
use super::worker_primitives::{sleep_with_stop, LoopEvent};
use super::{HostContext, RuntimeError};
use crate::inbox::{self, route_message, ClaimedMessage, InboxPaths, RouteDecision};
use crate::ipc::DrainReport;
use crate::shared::time::now_secs;
use crate::shared::TenantId;
use crate::tenant::Tenant;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

pub const SCHEDULER_LOOP: &str = "scheduler";
pub const MAILBOX_LOOP: &str = "mailbox";
pub const INBOX_LOOP: &str = "inbox";

const INBOX_BATCH_LIMIT: usize = 64;

/// Runs every task due at `now`. Returns how many ran.
pub fn tick_scheduler(ctx: &HostContext, now: i64) -> Result<usize, RuntimeError> {
    let runs = ctx.scheduler.tick(now, &ScheduledTurns::new(ctx))?;
    if !runs.is_empty() {
        ctx.log
            .info("scheduler.tick", &format!("dispatched={}", runs.len()));
    }
    Ok(runs.len())
}

/// Picks up mailbox entries written outside of a host-driven turn, such as
/// by a worker that outlived its turn or by an operator.
pub fn drain_mailboxes(ctx: &HostContext, now: i64) -> Result<DrainReport, RuntimeError> {
    let report = ctx.consumer.drain_all(now)?;
    if report.total() > 0 {
        ctx.log.info(
            "mailbox.drained",
            &format!(
                "applied={} denied={} dropped={} quarantined={}",
                report.applied, report.denied, report.dropped, report.quarantined
            ),
        );
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxReport {
    pub turns: usize,
    pub ignored: usize,
    pub rejected: usize,
}

struct TenantQueue {
    tenant: Tenant,
    messages: Vec<(ClaimedMessage, String)>,
}

/// One inbox pass: claim, route, then run turns. Messages of one tenant run
/// in arrival order; tenants run in parallel.
pub fn drain_inbox_once(ctx: &HostContext) -> Result<InboxReport, RuntimeError> {
    let inbox_paths = InboxPaths::from_state_paths(&ctx.paths);
    let batch = inbox::claim_batch(&inbox_paths, INBOX_BATCH_LIMIT)?;
    let mut report = InboxReport {
        rejected: batch.rejected.len(),
        ..InboxReport::default()
    };
    for path in &batch.rejected {
        ctx.log
            .warn("inbox.rejected", &format!("path={}", path.display()));
    }

    let mut queues: BTreeMap<TenantId, TenantQueue> = BTreeMap::new();
    for claimed in batch.messages {
        let decision = match route_message(
            &ctx.store,
            &ctx.registry,
            &ctx.trigger_prefix,
            &claimed.payload,
        ) {
            Ok(decision) => decision,
            Err(err) => {
                // Left in processing; recovered on the next host start.
                ctx.log.error(
                    "inbox.route.failed",
                    &format!("message_id={} error={err}", claimed.payload.message_id),
                );
                continue;
            }
        };
        match decision {
            RouteDecision::Trigger { tenant, prompt } => {
                queues
                    .entry(tenant.id.clone())
                    .or_insert_with(|| TenantQueue {
                        tenant,
                        messages: Vec::new(),
                    })
                    .messages
                    .push((claimed, prompt));
            }
            RouteDecision::Ignore(reason) => {
                report.ignored += 1;
                ctx.log.debug(
                    "inbox.ignored",
                    &format!(
                        "message_id={} chat={} reason={reason}",
                        claimed.payload.message_id, claimed.payload.chat
                    ),
                );
                complete_message(ctx, &claimed);
            }
        }
    }

    report.turns = thread::scope(|scope| {
        let handles = queues
            .values()
            .map(|queue| scope.spawn(move || run_tenant_queue(ctx, queue)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(0))
            .sum()
    });
    Ok(report)
}

fn run_tenant_queue(ctx: &HostContext, queue: &TenantQueue) -> usize {
    let mut turns = 0;
    for (claimed, prompt) in &queue.messages {
        let turn = run_agent_turn(ctx, &queue.tenant, prompt, &TurnKind::Live);
        turns += 1;
        if !turn.result.is_success() && ctx.runner.is_shutting_down() {
            // Left in processing; replayed on the next host start.
            ctx.log.warn(
                "inbox.turn.interrupted",
                &format!(
                    "tenant={} message_id={}",
                    queue.tenant.id, claimed.payload.message_id
                ),
            );
            break;
        }
        if !turn.result.is_success() {
            ctx.log.warn(
                "inbox.turn.failed",
                &format!(
                    "tenant={} message_id={} error={}",
                    queue.tenant.id,
                    claimed.payload.message_id,
                    turn.result.error.as_deref().unwrap_or("unknown")
                ),
            );
        }
        complete_message(ctx, claimed);
    }
    turns
}

fn complete_message(ctx: &HostContext, claimed: &ClaimedMessage) {
    if let Err(err) = inbox::complete(claimed) {
        ctx.log.warn(
            "inbox.complete.failed",
            &format!("message_id={} error={err}", claimed.payload.message_id),
        );
    }
}

/// Drives one host loop until `stop` is raised. `tick` errors are reported
/// and the loop carries on.
pub(crate) fn run_loop<F>(
    loop_id: &'static str,
    interval: Duration,
    stop: &AtomicBool,
    events: &Sender<LoopEvent>,
    mut tick: F,
) where
    F: FnMut() -> Result<(), RuntimeError>,
{
    let _ = events.send(LoopEvent::Started {
        loop_id,
        at: now_secs(),
    });

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if let Err(err) = tick() {
            let _ = events.send(LoopEvent::Error {
                loop_id,
                at: now_secs(),
                message: err.to_string(),
            });
        }
        if !sleep_with_stop(stop, interval) {
            break;
        }
    }

    let _ = events.send(LoopEvent::Stopped {
        loop_id,
        at: now_secs(),
    });
}
