use super::{invalid_column, sql_err, Store, StoreError};
use crate::scheduler::task::{
    ContextMode, RunStatus, ScheduleKind, ScheduledTask, TaskRunLog, TaskStatus,
};
use crate::shared::{TaskId, TenantId};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

const TASK_COLUMNS: &str = "id, tenant_id, chat_target, prompt, schedule_kind, schedule_value, \
     context_mode, status, next_run, last_run, last_result, created_at";

struct RawTask {
    id: String,
    tenant_id: String,
    chat_target: String,
    prompt: String,
    schedule_kind: String,
    schedule_value: String,
    context_mode: String,
    status: String,
    next_run: Option<i64>,
    last_run: Option<i64>,
    last_result: Option<String>,
    created_at: i64,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            chat_target: row.get(2)?,
            prompt: row.get(3)?,
            schedule_kind: row.get(4)?,
            schedule_value: row.get(5)?,
            context_mode: row.get(6)?,
            status: row.get(7)?,
            next_run: row.get(8)?,
            last_run: row.get(9)?,
            last_result: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask, StoreError> {
        Ok(ScheduledTask {
            id: TaskId::parse(&self.id).map_err(|err| invalid_column("id", &self.id, err))?,
            tenant_id: TenantId::parse(&self.tenant_id)
                .map_err(|err| invalid_column("tenant_id", &self.tenant_id, err))?,
            chat_target: self.chat_target,
            prompt: self.prompt,
            schedule_kind: ScheduleKind::parse(&self.schedule_kind)
                .map_err(|err| invalid_column("schedule_kind", &self.schedule_kind, err))?,
            schedule_value: self.schedule_value,
            context_mode: ContextMode::parse(&self.context_mode)
                .map_err(|err| invalid_column("context_mode", &self.context_mode, err))?,
            status: TaskStatus::parse(&self.status)
                .map_err(|err| invalid_column("status", &self.status, err))?,
            next_run: self.next_run,
            last_run: self.last_run,
            last_result: self.last_result,
            created_at: self.created_at,
        })
    }
}

impl Store {
    pub fn insert_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let connection = self.connect()?;
        let inserted = connection
            .execute(
                &format!(
                    "INSERT INTO scheduled_tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO NOTHING"
                ),
                params![
                    task.id.as_str(),
                    task.tenant_id.as_str(),
                    task.chat_target,
                    task.prompt,
                    task.schedule_kind.as_str(),
                    task.schedule_value,
                    task.context_mode.as_str(),
                    task.status.as_str(),
                    task.next_run,
                    task.last_run,
                    task.last_result,
                    task.created_at,
                ],
            )
            .map_err(sql_err)?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "task `{}` already exists",
                task.id
            )));
        }
        Ok(())
    }

    /// Persists the mutable columns of an existing task.
    pub fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let connection = self.connect()?;
        write_mutable_columns(&connection, task)
    }

    /// Loads a task, lets `apply` change it and writes it back, all inside
    /// one `BEGIN IMMEDIATE` transaction. Concurrent callers on the same
    /// database are serialized, so no update is lost between the read and
    /// the write. `Ok(None)` means the task does not exist. An error from
    /// `apply` rolls back.
    pub fn modify_task<T, E, F>(
        &self,
        task_id: &str,
        apply: F,
    ) -> Result<Option<(ScheduledTask, T)>, E>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        let raw = tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![task_id],
                RawTask::from_row,
            )
            .optional()
            .map_err(sql_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut task = raw.into_task()?;
        let value = apply(&mut task)?;
        write_mutable_columns(&tx, &task)?;
        tx.commit().map_err(sql_err)?;
        Ok(Some((task, value)))
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![task_id],
                RawTask::from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawTask::into_task).transpose()
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at, id"),
            params![],
        )
    }

    pub fn list_tasks_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE tenant_id = ?1 ORDER BY created_at, id"
            ),
            params![tenant_id.as_str()],
        )
    }

    /// Active tasks whose `next_run` is at or before `now`, oldest first.
    pub fn due_tasks(&self, now: i64) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run, id"
            ),
            params![now],
        )
    }

    pub fn append_run_log(&self, log: &TaskRunLog) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.task_id.as_str(),
                    log.run_at,
                    i64::try_from(log.duration_ms).unwrap_or(i64::MAX),
                    log.status.as_str(),
                    log.result,
                    log.error,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn list_run_logs(&self, task_id: &TaskId) -> Result<Vec<TaskRunLog>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT task_id, run_at, duration_ms, status, result, error
                 FROM task_run_logs WHERE task_id = ?1 ORDER BY run_at, id",
            )
            .map_err(sql_err)?;
        let rows = statement
            .query_map(params![task_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(sql_err)?;

        let mut logs = Vec::new();
        for row in rows {
            let (task_id, run_at, duration_ms, status, result, error) = row.map_err(sql_err)?;
            logs.push(TaskRunLog {
                task_id: TaskId::parse(&task_id)
                    .map_err(|err| invalid_column("task_id", &task_id, err))?,
                run_at,
                duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                status: RunStatus::parse(&status)
                    .map_err(|err| invalid_column("status", &status, err))?,
                result,
                error,
            });
        }
        Ok(logs)
    }

    fn query_tasks(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ScheduledTask>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(sql).map_err(sql_err)?;
        let rows = statement
            .query_map(params, RawTask::from_row)
            .map_err(sql_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(sql_err)?.into_task()?);
        }
        Ok(tasks)
    }
}

fn write_mutable_columns(connection: &Connection, task: &ScheduledTask) -> Result<(), StoreError> {
    let updated = connection
        .execute(
            "UPDATE scheduled_tasks
             SET status = ?2, next_run = ?3, last_run = ?4, last_result = ?5
             WHERE id = ?1",
            params![
                task.id.as_str(),
                task.status.as_str(),
                task.next_run,
                task.last_run,
                task.last_result,
            ],
        )
        .map_err(sql_err)?;
    if updated == 0 {
        return Err(StoreError::Conflict(format!(
            "task `{}` does not exist",
            task.id
        )));
    }
    Ok(())
}
