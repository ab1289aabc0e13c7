use super::mailbox::{claim_entry, list_entries, ClaimedEntry, MailboxKind};
use super::message::{OutgoingRequest, TaskRequest};
use super::snapshot::refresh_snapshots;
use super::{io_err, IpcError};
use crate::authz::{authorize, Decision, Operation};
use crate::gateway::ChatGateway;
use crate::runtime::StatePaths;
use crate::scheduler::{validate_schedule, NewTask, ScheduleKind, Scheduler, TaskStatus};
use crate::shared::{EventLog, TenantId};
use crate::store::Store;
use crate::tenant::{ensure_workspace, Tenant, TenantRegistry, TenantWorkspace};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub denied: usize,
    pub dropped: usize,
    pub quarantined: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.applied + self.denied + self.dropped + self.quarantined
    }

    fn merge(&mut self, other: DrainReport) {
        self.applied += other.applied;
        self.denied += other.denied;
        self.dropped += other.dropped;
        self.quarantined += other.quarantined;
    }
}

enum EntryOutcome {
    Applied,
    Denied(String),
    /// Well-formed but not applicable (unknown task, bad schedule, gateway
    /// failure). Logged and deleted.
    Dropped(String),
    /// Unreadable or malformed. Moved to `ipc/errors`.
    Malformed(String),
}

/// Host side of the mailbox. Applies each request at most once, with the
/// requester identified only by the directory the request was found in.
#[derive(Clone)]
pub struct MailboxConsumer {
    paths: StatePaths,
    store: Store,
    registry: TenantRegistry,
    scheduler: Scheduler,
    gateway: Arc<dyn ChatGateway>,
    log: EventLog,
}

impl MailboxConsumer {
    pub fn new(
        paths: StatePaths,
        registry: TenantRegistry,
        scheduler: Scheduler,
        gateway: Arc<dyn ChatGateway>,
        log: EventLog,
    ) -> Self {
        Self {
            store: scheduler.store().clone(),
            paths,
            registry,
            scheduler,
            gateway,
            log,
        }
    }

    /// Drains every tenant directory under `ipc/`. Entries left by a
    /// directory that belongs to no registered tenant are quarantined.
    pub fn drain_all(&self, now: i64) -> Result<DrainReport, IpcError> {
        let ipc_dir = self.paths.ipc_dir();
        let errors_dir = self.paths.ipc_errors_dir();
        let reader = match fs::read_dir(&ipc_dir) {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(DrainReport::default()),
            Err(err) => return Err(io_err(&ipc_dir, err)),
        };

        let mut names = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|source| io_err(&ipc_dir, source))?;
            let path = entry.path();
            if path.is_dir() && path != errors_dir {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut report = DrainReport::default();
        for name in names {
            match self.registry.get(&name) {
                Ok(Some(tenant)) => match self.drain_tenant(&tenant, now) {
                    Ok(tenant_report) => report.merge(tenant_report),
                    Err(err) => self.log.error(
                        "ipc.drain.failed",
                        &format!("tenant={name} error={err}"),
                    ),
                },
                Ok(None) => report.merge(self.quarantine_unregistered(&name)?),
                Err(err) => self
                    .log
                    .error("ipc.drain.failed", &format!("tenant={name} error={err}")),
            }
        }
        Ok(report)
    }

    pub fn drain_tenant(&self, tenant: &Tenant, now: i64) -> Result<DrainReport, IpcError> {
        let workspace = TenantWorkspace::resolve(&self.paths, &tenant.id);
        let mut report = DrainReport::default();
        let mut tasks_touched = false;

        for kind in MailboxKind::ALL {
            let dir = workspace.ipc_dir.join(kind.dir_name());
            for path in list_entries(&dir)? {
                let Some(claimed) = claim_entry(&path)? else {
                    continue;
                };
                let name = claimed.file_name();
                let outcome = match kind {
                    MailboxKind::Messages => self.apply_message(tenant, &claimed),
                    MailboxKind::Tasks => self.apply_task(tenant, &claimed, now),
                };
                if kind == MailboxKind::Tasks && matches!(outcome, EntryOutcome::Applied) {
                    tasks_touched = true;
                }
                self.settle(tenant, claimed, &name, kind, outcome, &mut report)?;
            }
        }

        if tasks_touched {
            if let Err(err) = refresh_snapshots(&self.store, &self.registry, &workspace, tenant) {
                self.log.warn(
                    "ipc.snapshot.failed",
                    &format!("tenant={} error={err}", tenant.id),
                );
            }
        }
        Ok(report)
    }

    fn settle(
        &self,
        tenant: &Tenant,
        claimed: ClaimedEntry,
        name: &str,
        kind: MailboxKind,
        outcome: EntryOutcome,
        report: &mut DrainReport,
    ) -> Result<(), IpcError> {
        let kind = kind.dir_name();
        match outcome {
            EntryOutcome::Applied => {
                claimed.complete()?;
                report.applied += 1;
                self.log.info(
                    "ipc.applied",
                    &format!("tenant={} kind={kind} entry={name}", tenant.id),
                );
            }
            EntryOutcome::Denied(reason) => {
                claimed.complete()?;
                report.denied += 1;
                self.log.security(
                    "ipc.denied",
                    tenant.id.as_str(),
                    &format!("kind={kind} entry={name} reason={reason}"),
                );
            }
            EntryOutcome::Dropped(reason) => {
                claimed.complete()?;
                report.dropped += 1;
                self.log.warn(
                    "ipc.dropped",
                    &format!("tenant={} kind={kind} entry={name} reason={reason}", tenant.id),
                );
            }
            EntryOutcome::Malformed(reason) => {
                let target = claimed.quarantine(&self.paths.ipc_errors_dir(), tenant.id.as_str())?;
                report.quarantined += 1;
                self.log.warn(
                    "ipc.quarantined",
                    &format!(
                        "tenant={} kind={kind} entry={name} target={} reason={reason}",
                        tenant.id,
                        target.display()
                    ),
                );
            }
        }
        Ok(())
    }

    fn quarantine_unregistered(&self, dir_name: &str) -> Result<DrainReport, IpcError> {
        let mut report = DrainReport::default();
        let tenant_dir = self.paths.ipc_dir().join(dir_name);
        for kind in MailboxKind::ALL {
            for path in list_entries(&tenant_dir.join(kind.dir_name()))? {
                let Some(claimed) = claim_entry(&path)? else {
                    continue;
                };
                let name = claimed.file_name();
                claimed.quarantine(&self.paths.ipc_errors_dir(), dir_name)?;
                report.quarantined += 1;
                self.log.security(
                    "ipc.unregistered",
                    dir_name,
                    &format!("kind={} entry={name}", kind.dir_name()),
                );
            }
        }
        Ok(report)
    }

    fn apply_message(&self, tenant: &Tenant, claimed: &ClaimedEntry) -> EntryOutcome {
        let request: OutgoingRequest = match claimed.read_json() {
            Ok(request) => request,
            Err(err) => return EntryOutcome::Malformed(err.to_string()),
        };
        let operation = Operation::SendMessage {
            target_chat: &request.target_chat,
        };
        if let Decision::Deny(reason) = authorize(tenant, &operation) {
            return EntryOutcome::Denied(reason);
        }
        match self.gateway.send_message(&request.target_chat, &request.body) {
            Ok(()) => EntryOutcome::Applied,
            Err(err) => EntryOutcome::Dropped(format!("delivery failed: {err}")),
        }
    }

    fn apply_task(&self, tenant: &Tenant, claimed: &ClaimedEntry, now: i64) -> EntryOutcome {
        let request: TaskRequest = match claimed.read_json() {
            Ok(request) => request,
            Err(err) => return EntryOutcome::Malformed(err.to_string()),
        };

        match request {
            TaskRequest::Schedule {
                prompt,
                schedule_kind,
                schedule_value,
                target_chat,
                context_mode,
            } => {
                let kind = match ScheduleKind::parse(&schedule_kind) {
                    Ok(kind) => kind,
                    Err(err) => return EntryOutcome::Dropped(err),
                };
                // A bad schedule is dropped before anything else is looked up.
                if let Err(reason) = validate_schedule(kind, &schedule_value) {
                    return EntryOutcome::Dropped(reason);
                }
                let target = match target_chat {
                    Some(chat) => match self.registry.by_chat(&chat) {
                        Ok(Some(target)) => target,
                        Ok(None) => {
                            return EntryOutcome::Dropped(format!(
                                "target chat `{chat}` is not registered"
                            ))
                        }
                        Err(err) => return EntryOutcome::Dropped(err.to_string()),
                    },
                    None => tenant.clone(),
                };
                if let Decision::Deny(reason) =
                    authorize(tenant, &Operation::ScheduleTask { target: &target })
                {
                    return EntryOutcome::Denied(reason);
                }
                let input = NewTask {
                    tenant_id: target.id,
                    chat_target: target.chat_target,
                    prompt,
                    schedule_kind: kind,
                    schedule_value,
                    context_mode: context_mode.unwrap_or_default(),
                };
                match self.scheduler.create_task(input, now) {
                    Ok(_) => EntryOutcome::Applied,
                    Err(err) => EntryOutcome::Dropped(err.to_string()),
                }
            }
            TaskRequest::Pause { task_id } => {
                self.apply_status(tenant, &task_id, TaskStatus::Paused)
            }
            TaskRequest::Resume { task_id } => {
                self.apply_status(tenant, &task_id, TaskStatus::Active)
            }
            TaskRequest::Cancel { task_id } => {
                self.apply_status(tenant, &task_id, TaskStatus::Cancelled)
            }
            TaskRequest::RefreshGroups => {
                if let Decision::Deny(reason) = authorize(tenant, &Operation::RefreshGroups) {
                    return EntryOutcome::Denied(reason);
                }
                match self.refresh_groups(now) {
                    Ok(()) => EntryOutcome::Applied,
                    Err(reason) => EntryOutcome::Dropped(reason),
                }
            }
            TaskRequest::RegisterGroup {
                tenant_id,
                name,
                chat,
            } => {
                if let Decision::Deny(reason) = authorize(tenant, &Operation::RegisterTenant) {
                    return EntryOutcome::Denied(reason);
                }
                match self.register_group(&tenant_id, &name, &chat, now) {
                    Ok(()) => EntryOutcome::Applied,
                    Err(reason) => EntryOutcome::Dropped(reason),
                }
            }
        }
    }

    fn apply_status(&self, tenant: &Tenant, task_id: &str, to: TaskStatus) -> EntryOutcome {
        // Ownership is read from the stored row, never from the request.
        let task = match self.scheduler.load_task(task_id) {
            Ok(task) => task,
            Err(err) => return EntryOutcome::Dropped(err.to_string()),
        };
        let owner = &task.tenant_id;
        let operation = match to {
            TaskStatus::Paused => Operation::PauseTask { owner },
            TaskStatus::Active => Operation::ResumeTask { owner },
            TaskStatus::Cancelled => Operation::CancelTask { owner },
        };
        if let Decision::Deny(reason) = authorize(tenant, &operation) {
            return EntryOutcome::Denied(reason);
        }
        match self.scheduler.set_status(task_id, to) {
            Ok(_) => EntryOutcome::Applied,
            Err(err) => EntryOutcome::Dropped(err.to_string()),
        }
    }

    fn refresh_groups(&self, now: i64) -> Result<(), String> {
        let groups = self.gateway.sync_groups().map_err(|err| err.to_string())?;
        for group in &groups {
            self.store.upsert_chat(group).map_err(|err| err.to_string())?;
        }
        self.store
            .record_group_sync(now)
            .map_err(|err| err.to_string())?;
        self.log
            .info("ipc.groups.refreshed", &format!("groups={}", groups.len()));
        Ok(())
    }

    fn register_group(
        &self,
        tenant_id: &str,
        name: &str,
        chat: &str,
        now: i64,
    ) -> Result<(), String> {
        let id = TenantId::parse(tenant_id)?;
        let tenant = self
            .registry
            .register(&id, name, chat, now)
            .map_err(|err| err.to_string())?;
        ensure_workspace(&self.paths, &tenant.id).map_err(|err| err.to_string())?;
        self.log.info(
            "tenant.registered",
            &format!("tenant={} chat={}", tenant.id, tenant.chat_target),
        );
        Ok(())
    }
}
