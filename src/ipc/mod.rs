//! Filesystem mailbox between workers and the host.
//!
//! Workers drop one JSON file per request into `ipc/{tenant}/messages` or
//! `ipc/{tenant}/tasks`; the host claims, authorizes, applies and deletes
//! them. In the other direction the host keeps `current_tasks.json` and
//! `available_groups.json` up to date for the worker to read.

pub mod consumer;
pub mod mailbox;
pub mod message;
pub mod snapshot;

pub use consumer::{DrainReport, MailboxConsumer};
pub use mailbox::{
    claim_entry, list_entries, recover_stale_claims, write_mailbox_entry, ClaimedEntry,
    MailboxKind,
};
pub use message::{OutgoingRequest, TaskRequest};
pub use snapshot::{
    refresh_snapshots, write_groups_snapshot, write_tasks_snapshot, GroupSnapshot,
    GroupsSnapshot, TaskSnapshot,
};

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("ipc io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid mailbox payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to name mailbox entry: {0}")]
    Naming(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn parse_err(path: &Path, source: serde_json::Error) -> IpcError {
    IpcError::Parse {
        path: path.display().to_string(),
        source,
    }
}
