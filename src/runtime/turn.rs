//! One agent turn: prepare the tenant, run the worker, apply what it asked
//! for, deliver what it said.

use super::HostContext;
use crate::ipc::{refresh_snapshots, DrainReport};
use crate::scheduler::{ContextMode, ScheduledTask, TaskExecutor, TaskOutcome};
use crate::shared::time::now_secs;
use crate::tenant::{ensure_workspace, Tenant};
use crate::worker::{WorkerError, WorkerInvocation, WorkerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    /// Triggered by an inbound chat message; always resumes the session.
    Live,
    Scheduled {
        context_mode: ContextMode,
        deliver_to: String,
    },
}

impl TurnKind {
    fn uses_session(&self) -> bool {
        match self {
            Self::Live => true,
            Self::Scheduled { context_mode, .. } => *context_mode == ContextMode::Group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub result: WorkerResult,
    pub mailbox: DrainReport,
    pub delivered: bool,
}

pub fn run_agent_turn(
    ctx: &HostContext,
    tenant: &Tenant,
    prompt: &str,
    kind: &TurnKind,
) -> TurnReport {
    let workspace = match ensure_workspace(&ctx.paths, &tenant.id) {
        Ok(workspace) => workspace,
        Err(err) => {
            let err = WorkerError::from(err);
            ctx.log
                .error("turn.workspace.failed", &format!("tenant={} error={err}", tenant.id));
            return TurnReport {
                result: WorkerResult::from_error(&err),
                mailbox: DrainReport::default(),
                delivered: false,
            };
        }
    };

    if let Err(err) = refresh_snapshots(&ctx.store, &ctx.registry, &workspace, tenant) {
        ctx.log
            .warn("turn.snapshot.failed", &format!("tenant={} error={err}", tenant.id));
    }

    let session = if kind.uses_session() {
        ctx.store.get_session(&tenant.id).unwrap_or_else(|err| {
            ctx.log
                .warn("turn.session.read_failed", &format!("tenant={} error={err}", tenant.id));
            None
        })
    } else {
        None
    };

    let mut invocation = WorkerInvocation::for_tenant(tenant, prompt).with_session(session);
    if matches!(kind, TurnKind::Scheduled { .. }) {
        invocation = invocation.scheduled();
    }
    let result = ctx.runner.invoke(&invocation);

    if kind.uses_session() && result.is_success() {
        if let Some(new_session) = result.new_session_id.as_deref() {
            if let Err(err) = ctx.store.set_session(&tenant.id, new_session, now_secs()) {
                ctx.log
                    .warn("turn.session.write_failed", &format!("tenant={} error={err}", tenant.id));
            }
        }
    }

    // Requests written during the run are applied before the reply goes
    // out, so a reply can refer to a task the worker just scheduled.
    let mailbox = match ctx.consumer.drain_tenant(tenant, now_secs()) {
        Ok(report) => report,
        Err(err) => {
            ctx.log
                .error("turn.mailbox.failed", &format!("tenant={} error={err}", tenant.id));
            DrainReport::default()
        }
    };

    let target = match kind {
        TurnKind::Live => tenant.chat_target.as_str(),
        TurnKind::Scheduled { deliver_to, .. } => deliver_to.as_str(),
    };
    let delivered = deliver_result(ctx, tenant, target, &result);

    TurnReport {
        result,
        mailbox,
        delivered,
    }
}

fn deliver_result(ctx: &HostContext, tenant: &Tenant, target: &str, result: &WorkerResult) -> bool {
    if !result.is_success() {
        return false;
    }
    let Some(text) = result.result.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        return false;
    };
    match ctx.gateway.send_message(target, text) {
        Ok(()) => true,
        Err(err) => {
            ctx.log.error(
                "turn.delivery.failed",
                &format!("tenant={} chat={target} error={err}", tenant.id),
            );
            false
        }
    }
}

/// Runs due tasks as scheduled agent turns of their owning tenant.
pub struct ScheduledTurns<'a> {
    ctx: &'a HostContext,
}

impl<'a> ScheduledTurns<'a> {
    pub fn new(ctx: &'a HostContext) -> Self {
        Self { ctx }
    }
}

impl TaskExecutor for ScheduledTurns<'_> {
    fn execute(&self, task: &ScheduledTask) -> TaskOutcome {
        let tenant = match self.ctx.registry.get(task.tenant_id.as_str()) {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                return TaskOutcome::failure(format!(
                    "tenant `{}` is not registered",
                    task.tenant_id
                ))
            }
            Err(err) => return TaskOutcome::failure(err.to_string()),
        };

        let kind = TurnKind::Scheduled {
            context_mode: task.context_mode,
            deliver_to: task.chat_target.clone(),
        };
        let report = run_agent_turn(self.ctx, &tenant, &task.prompt, &kind);
        if report.result.is_success() {
            TaskOutcome::success(report.result.result)
        } else {
            TaskOutcome::failure(
                report
                    .result
                    .error
                    .unwrap_or_else(|| "worker reported an error".to_string()),
            )
        }
    }
}
