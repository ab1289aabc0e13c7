use super::RuntimeError;
use std::fs;
use std::path::{Path, PathBuf};

/// Fixed layout of everything the host keeps under its state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.groups_dir(),
            self.global_dir(),
            self.ipc_dir(),
            self.ipc_errors_dir(),
            self.sessions_dir(),
            self.logs_dir(),
            self.daemon_dir(),
            self.inbox_incoming_dir(),
            self.inbox_processing_dir(),
            self.inbox_failed_dir(),
            self.outbox_dir(),
            self.outbox_messages_dir(),
        ]
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    /// Shared read-mostly memory directory every worker sees.
    pub fn global_dir(&self) -> PathBuf {
        self.groups_dir().join("global")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.root.join("ipc")
    }

    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir().join("errors")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join("store/clawkeeper.db")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn host_lock_path(&self) -> PathBuf {
        self.daemon_dir().join("host.lock")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    pub fn inbox_incoming_dir(&self) -> PathBuf {
        self.root.join("inbox/incoming")
    }

    pub fn inbox_processing_dir(&self) -> PathBuf {
        self.root.join("inbox/processing")
    }

    /// Inbound files that could not be parsed.
    pub fn inbox_failed_dir(&self) -> PathBuf {
        self.root.join("inbox/failed")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn outbox_messages_dir(&self) -> PathBuf {
        self.outbox_dir().join("messages")
    }

    /// Group metadata maintained by the chat transport.
    pub fn group_metadata_path(&self) -> PathBuf {
        self.outbox_dir().join("groups.json")
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        create_dir(&path)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(path).map_err(|source| RuntimeError::CreateDir {
        path: path.display().to_string(),
        source,
    })
}
