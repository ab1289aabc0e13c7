use super::{io_err, IpcError};
use crate::authz::{visible_groups, visible_tasks};
use crate::scheduler::ScheduledTask;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::time::format_rfc3339;
use crate::store::{ChatRecord, Store};
use crate::tenant::{Tenant, TenantRegistry, TenantWorkspace};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Read-only projection of a task, as a worker sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub tenant_id: String,
    pub prompt: String,
    pub schedule_kind: String,
    pub schedule_value: String,
    pub context_mode: String,
    pub status: String,
    pub next_run: Option<String>,
}

impl From<&ScheduledTask> for TaskSnapshot {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            id: task.id.to_string(),
            tenant_id: task.tenant_id.to_string(),
            prompt: task.prompt.clone(),
            schedule_kind: task.schedule_kind.as_str().to_string(),
            schedule_value: task.schedule_value.clone(),
            context_mode: task.context_mode.as_str().to_string(),
            status: task.status.as_str().to_string(),
            next_run: task.next_run.map(format_rfc3339),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub chat_id: String,
    pub name: String,
    pub last_activity: String,
    pub is_registered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupsSnapshot {
    pub groups: Vec<GroupSnapshot>,
    pub last_sync: String,
}

pub fn write_tasks_snapshot(
    workspace: &TenantWorkspace,
    requester: &Tenant,
    tasks: Vec<ScheduledTask>,
) -> Result<(), IpcError> {
    let view: Vec<TaskSnapshot> = visible_tasks(requester, tasks)
        .iter()
        .map(TaskSnapshot::from)
        .collect();
    let path = workspace.current_tasks_snapshot();
    atomic_write_json(&path, &view).map_err(|source| io_err(&path, source))
}

/// Writes `available_groups.json`. Non-privileged tenants always get an
/// empty list.
pub fn write_groups_snapshot(
    workspace: &TenantWorkspace,
    requester: &Tenant,
    chats: Vec<ChatRecord>,
    registered_chats: &HashSet<String>,
    last_sync: i64,
) -> Result<(), IpcError> {
    let groups = visible_groups(requester, chats)
        .into_iter()
        .map(|chat| GroupSnapshot {
            is_registered: registered_chats.contains(&chat.chat_id),
            last_activity: format_rfc3339(chat.last_activity),
            chat_id: chat.chat_id,
            name: chat.name,
        })
        .collect();
    let snapshot = GroupsSnapshot {
        groups,
        last_sync: format_rfc3339(last_sync),
    };
    let path = workspace.available_groups_snapshot();
    atomic_write_json(&path, &snapshot).map_err(|source| io_err(&path, source))
}

/// Rewrites both snapshot files of `requester` from current host state.
pub fn refresh_snapshots(
    store: &Store,
    registry: &TenantRegistry,
    workspace: &TenantWorkspace,
    requester: &Tenant,
) -> Result<(), IpcError> {
    write_tasks_snapshot(workspace, requester, store.list_tasks()?)?;

    let registered: HashSet<String> = registry
        .list()?
        .into_iter()
        .map(|tenant| tenant.chat_target)
        .collect();
    let last_sync = store.last_group_sync()?.unwrap_or(0);
    write_groups_snapshot(
        workspace,
        requester,
        store.list_chats()?,
        &registered,
        last_sync,
    )
}
