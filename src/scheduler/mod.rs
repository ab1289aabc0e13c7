//! Persisted task schedules and the polling tick that runs them.

pub mod schedule;
pub mod task;

pub use schedule::{compute_next_run, validate_schedule};
pub use task::{
    ContextMode, NewTask, RunStatus, ScheduleKind, ScheduledTask, TaskRunLog, TaskStatus,
};

use crate::shared::ids::generate_task_id;
use crate::shared::time::now_millis;
use crate::shared::{EventLog, TaskId};
use crate::store::{Store, StoreError};
use chrono_tz::Tz;
use std::thread;
use std::time::Instant;

const LAST_RESULT_SUMMARY_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid {kind} schedule `{value}`: {reason}")]
    InvalidSchedule {
        kind: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("task `{task_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("{0}")]
    TaskId(String),
}

/// What one scheduled run produced, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            result,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Runs the prompt of one due task. Called from scoped threads, one per due
/// task, so implementations must tolerate concurrent calls.
pub trait TaskExecutor: Sync {
    fn execute(&self, task: &ScheduledTask) -> TaskOutcome;
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    store: Store,
    timezone: Tz,
    log: EventLog,
}

impl Scheduler {
    pub fn new(store: Store, timezone: Tz, log: EventLog) -> Self {
        Self {
            store,
            timezone,
            log,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn create_task(&self, input: NewTask, now: i64) -> Result<ScheduledTask, SchedulerError> {
        let next_run = compute_next_run(
            input.schedule_kind,
            &input.schedule_value,
            now,
            None,
            &self.timezone,
        )
        .map_err(|reason| SchedulerError::InvalidSchedule {
            kind: input.schedule_kind.as_str(),
            value: input.schedule_value.clone(),
            reason,
        })?;

        let task = ScheduledTask {
            id: generate_task_id(now_millis()).map_err(SchedulerError::TaskId)?,
            tenant_id: input.tenant_id,
            chat_target: input.chat_target,
            prompt: input.prompt,
            schedule_kind: input.schedule_kind,
            schedule_value: input.schedule_value,
            context_mode: input.context_mode,
            status: TaskStatus::Active,
            next_run,
            last_run: None,
            last_result: None,
            created_at: now,
        };
        self.store.insert_task(&task)?;
        self.log.info(
            "scheduler.task.created",
            &format!(
                "task={} tenant={} kind={} next_run={:?}",
                task.id,
                task.tenant_id,
                task.schedule_kind.as_str(),
                task.next_run
            ),
        );
        Ok(task)
    }

    pub fn load_task(&self, task_id: &str) -> Result<ScheduledTask, SchedulerError> {
        self.store
            .get_task(task_id)?
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))
    }

    /// Moves a task between `active`, `paused` and `cancelled`. Cancelling
    /// clears `next_run`; the row itself is kept.
    pub fn set_status(
        &self,
        task_id: &str,
        to: TaskStatus,
    ) -> Result<ScheduledTask, SchedulerError> {
        let (task, ()) = self
            .store
            .modify_task(task_id, |task| {
                if !task.status.can_transition_to(to) {
                    return Err(SchedulerError::InvalidTransition {
                        task_id: task_id.to_string(),
                        from: task.status.as_str(),
                        to: to.as_str(),
                    });
                }
                task.status = to;
                if to == TaskStatus::Cancelled {
                    task.next_run = None;
                }
                Ok(())
            })?
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        self.log.info(
            "scheduler.task.status",
            &format!("task={} status={}", task.id, to.as_str()),
        );
        Ok(task)
    }

    /// Runs every task that is active and due at `now`, then advances each
    /// one's schedule whether the run succeeded or not.
    pub fn tick<E: TaskExecutor + ?Sized>(
        &self,
        now: i64,
        executor: &E,
    ) -> Result<Vec<TaskRunLog>, SchedulerError> {
        let due = self.store.due_tasks(now)?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let runs: Vec<(&ScheduledTask, TaskOutcome, u64)> = thread::scope(|scope| {
            let handles: Vec<_> = due
                .iter()
                .map(|task| {
                    let handle = scope.spawn(move || {
                        let started = Instant::now();
                        let outcome = executor.execute(task);
                        (outcome, started.elapsed().as_millis() as u64)
                    });
                    (task, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(task, handle)| match handle.join() {
                    Ok((outcome, duration_ms)) => (task, outcome, duration_ms),
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        self.log.error(
                            "scheduler.task.panicked",
                            &format!("task={} error={reason}", task.id),
                        );
                        (task, TaskOutcome::failure(format!("executor panicked: {reason}")), 0)
                    }
                })
                .collect()
        });

        let mut logs = Vec::with_capacity(runs.len());
        for (task, outcome, duration_ms) in runs {
            let log = TaskRunLog {
                task_id: task.id.clone(),
                run_at: now,
                duration_ms,
                status: outcome.status,
                result: outcome.result.clone(),
                error: outcome.error.clone(),
            };
            if let Err(err) = self.finish_run(&task.id, &outcome, now) {
                self.log.error("scheduler.task.advance_failed", &err.to_string());
            }
            if let Err(err) = self.store.append_run_log(&log) {
                self.log.error("scheduler.run_log.failed", &err.to_string());
            }
            logs.push(log);
        }
        Ok(logs)
    }

    fn finish_run(
        &self,
        task_id: &TaskId,
        outcome: &TaskOutcome,
        now: i64,
    ) -> Result<(), SchedulerError> {
        // Read and write in one transaction so a pause/cancel applied while
        // the worker ran is kept.
        let (current, ()) = self
            .store
            .modify_task(task_id.as_str(), |current| {
                current.last_run = Some(now);
                current.last_result = Some(summarize(outcome));
                if current.status == TaskStatus::Cancelled {
                    return Ok::<_, SchedulerError>(());
                }
                match compute_next_run(
                    current.schedule_kind,
                    &current.schedule_value,
                    now,
                    Some(now),
                    &self.timezone,
                ) {
                    Ok(Some(next)) => current.next_run = Some(next),
                    Ok(None) => {
                        current.next_run = None;
                        current.status = TaskStatus::Cancelled;
                    }
                    Err(reason) => {
                        self.log.error(
                            "scheduler.task.invalid_schedule",
                            &format!("task={} {reason}", current.id),
                        );
                        current.next_run = None;
                        current.status = TaskStatus::Cancelled;
                    }
                }
                Ok(())
            })?
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

        match outcome.status {
            RunStatus::Success => self.log.info(
                "scheduler.task.completed",
                &format!("task={} next_run={:?}", current.id, current.next_run),
            ),
            RunStatus::Error => self.log.warn(
                "scheduler.task.failed",
                &format!(
                    "task={} error={} next_run={:?}",
                    current.id,
                    outcome.error.as_deref().unwrap_or("unknown"),
                    current.next_run
                ),
            ),
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn summarize(outcome: &TaskOutcome) -> String {
    match outcome.status {
        RunStatus::Success => outcome
            .result
            .as_deref()
            .unwrap_or("Completed")
            .chars()
            .take(LAST_RESULT_SUMMARY_CHARS)
            .collect(),
        RunStatus::Error => format!(
            "Error: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
