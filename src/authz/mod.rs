//! Per-tenant authorization for mailbox requests and snapshot views.
//!
//! The requester is always the tenant whose mailbox directory a request was
//! found in; nothing a worker writes inside the request can change that.
//! Task ownership comes from the persisted task row.

use crate::scheduler::task::ScheduledTask;
use crate::shared::TenantId;
use crate::tenant::Tenant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    SendMessage { target_chat: &'a str },
    ScheduleTask { target: &'a Tenant },
    PauseTask { owner: &'a TenantId },
    ResumeTask { owner: &'a TenantId },
    CancelTask { owner: &'a TenantId },
    RefreshGroups,
    RegisterTenant,
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::ScheduleTask { .. } => "schedule",
            Self::PauseTask { .. } => "pause",
            Self::ResumeTask { .. } => "resume",
            Self::CancelTask { .. } => "cancel",
            Self::RefreshGroups => "refresh_groups",
            Self::RegisterTenant => "register_group",
        }
    }
}

pub fn authorize(requester: &Tenant, operation: &Operation<'_>) -> Decision {
    if requester.is_privileged {
        return Decision::Allow;
    }

    match operation {
        Operation::SendMessage { target_chat } => {
            if requester.owns_chat(target_chat) {
                Decision::Allow
            } else {
                Decision::Deny(format!("target chat `{target_chat}` is not owned by requester"))
            }
        }
        Operation::ScheduleTask { target } => {
            if target.id == requester.id {
                Decision::Allow
            } else {
                Decision::Deny(format!(
                    "cannot schedule tasks for tenant `{}`",
                    target.id
                ))
            }
        }
        Operation::PauseTask { owner }
        | Operation::ResumeTask { owner }
        | Operation::CancelTask { owner } => {
            if **owner == requester.id {
                Decision::Allow
            } else {
                Decision::Deny(format!(
                    "{} targets a task owned by tenant `{owner}`",
                    operation.name()
                ))
            }
        }
        Operation::RefreshGroups | Operation::RegisterTenant => Decision::Deny(format!(
            "{} requires the privileged tenant",
            operation.name()
        )),
    }
}

/// Tasks a tenant may see in its `current_tasks` snapshot.
pub fn visible_tasks(requester: &Tenant, tasks: Vec<ScheduledTask>) -> Vec<ScheduledTask> {
    if requester.is_privileged {
        return tasks;
    }
    tasks
        .into_iter()
        .filter(|task| task.tenant_id == requester.id)
        .collect()
}

/// Groups a tenant may see in its `available_groups` snapshot.
pub fn visible_groups<T>(requester: &Tenant, groups: Vec<T>) -> Vec<T> {
    if requester.is_privileged {
        groups
    } else {
        Vec::new()
    }
}
