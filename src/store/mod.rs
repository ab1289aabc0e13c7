//! SQLite-backed host state: scheduled tasks and their run history, the
//! tenant registry, per-tenant session tokens and known chats.
//!
//! The host process is the only writer. Each operation opens its own
//! connection, so a `Store` can be cloned into any thread.

pub mod chats;
pub mod sessions;
pub mod tasks;
pub mod tenants;

pub use chats::ChatRecord;
pub use tenants::TenantRecord;

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid {column} value `{value}` in database: {reason}")]
    InvalidColumn {
        column: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Conflict(String),
}

pub(crate) fn sql_err(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS scheduled_tasks (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    chat_target TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    schedule_kind TEXT NOT NULL,
                    schedule_value TEXT NOT NULL,
                    context_mode TEXT NOT NULL,
                    status TEXT NOT NULL,
                    next_run INTEGER,
                    last_run INTEGER,
                    last_result TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_run_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    run_at INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    result TEXT,
                    error TEXT,
                    FOREIGN KEY (task_id) REFERENCES scheduled_tasks(id)
                );

                CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    chat_target TEXT NOT NULL UNIQUE,
                    added_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    tenant_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chats (
                    chat_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    last_activity INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS host_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due
                    ON scheduled_tasks(status, next_run);
                CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_tenant
                    ON scheduled_tasks(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_task_run_logs_task
                    ON task_run_logs(task_id, run_at);
                ",
            )
            .map_err(sql_err)
    }

    pub(crate) fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
            )
            .map_err(sql_err)?;
        Ok(connection)
    }
}

pub(crate) fn invalid_column(column: &'static str, value: &str, reason: String) -> StoreError {
    StoreError::InvalidColumn {
        column,
        value: value.to_string(),
        reason,
    }
}
