//! Worker subprocess lifecycle: spawn, feed, bound, time out, reap, parse.

pub mod audit;
pub mod capture;
pub mod environment;
pub mod live;
pub mod output_parse;
pub mod runner;

pub use output_parse::{parse_worker_output, OUTPUT_END_MARKER, OUTPUT_START_MARKER};
pub use live::LiveWorkers;
pub use runner::WorkerRunner;

use crate::shared::TenantId;
use crate::tenant::{Tenant, WorkspaceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The single JSON line written to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInvocation {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tenant_id: TenantId,
    pub chat_target: String,
    pub is_privileged: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_scheduled_task: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl WorkerInvocation {
    /// The privilege flag is copied from the tenant here and nowhere else.
    pub fn for_tenant(tenant: &Tenant, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
            tenant_id: tenant.id.clone(),
            chat_target: tenant.chat_target.clone(),
            is_privileged: tenant.is_privileged,
            is_scheduled_task: false,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn scheduled(mut self) -> Self {
        self.is_scheduled_task = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Error,
}

/// Terminal outcome of one invocation, in the shape workers emit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub status: WorkerStatus,
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkerStatus::Success
    }

    pub fn from_error(err: &WorkerError) -> Self {
        Self {
            status: WorkerStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationLog {
    pub tenant_id: String,
    pub binary: String,
    pub working_directory: PathBuf,
    pub started_at: i64,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    Spawn,
    Timeout,
    NonZeroExit,
    OutputParse,
    Filesystem,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
        log: Box<InvocationLog>,
    },
    #[error("worker timed out after {timeout_ms}ms")]
    Timeout {
        timeout_ms: u64,
        log: Box<InvocationLog>,
    },
    #[error("worker exited with code {exit_code}: {stderr_tail}")]
    NonZeroExit {
        exit_code: i32,
        stderr_tail: String,
        log: Box<InvocationLog>,
    },
    #[error("failed to parse worker output: {reason}")]
    OutputParse {
        reason: String,
        log: Box<InvocationLog>,
    },
    #[error("worker filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    pub fn kind(&self) -> WorkerErrorKind {
        match self {
            Self::Spawn { .. } => WorkerErrorKind::Spawn,
            Self::Timeout { .. } => WorkerErrorKind::Timeout,
            Self::NonZeroExit { .. } => WorkerErrorKind::NonZeroExit,
            Self::OutputParse { .. } => WorkerErrorKind::OutputParse,
            Self::Filesystem { .. } => WorkerErrorKind::Filesystem,
        }
    }

    pub fn log(&self) -> Option<&InvocationLog> {
        match self {
            Self::Spawn { log, .. }
            | Self::Timeout { log, .. }
            | Self::NonZeroExit { log, .. }
            | Self::OutputParse { log, .. } => Some(log),
            Self::Filesystem { .. } => None,
        }
    }
}

impl From<WorkspaceError> for WorkerError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::CreateDir { path, source } => Self::Filesystem { path, source },
        }
    }
}
