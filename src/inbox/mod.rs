//! Inbound chat messages dropped by the transport, claimed by rename.

pub mod router;

pub use router::{route_message, RouteDecision};

use crate::runtime::StatePaths;
use crate::shared::fs_atomic::is_hidden_name;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("inbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub chat: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub processing_path: PathBuf,
    pub payload: InboundMessage,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    pub messages: Vec<ClaimedMessage>,
    /// Files that could not be parsed, already moved to `inbox/failed`.
    pub rejected: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxPaths {
    pub incoming: PathBuf,
    pub processing: PathBuf,
    pub failed: PathBuf,
}

impl InboxPaths {
    pub fn from_state_paths(paths: &StatePaths) -> Self {
        Self {
            incoming: paths.inbox_incoming_dir(),
            processing: paths.inbox_processing_dir(),
            failed: paths.inbox_failed_dir(),
        }
    }
}

/// Claims up to `max` messages, oldest first.
pub fn claim_batch(paths: &InboxPaths, max: usize) -> Result<ClaimBatch, InboxError> {
    let mut batch = ClaimBatch::default();
    for incoming_path in sorted_incoming_paths(&paths.incoming)? {
        if batch.messages.len() >= max {
            break;
        }
        let Some(file_name) = incoming_path.file_name() else {
            continue;
        };
        let processing_path = paths.processing.join(file_name);

        match fs::rename(&incoming_path, &processing_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&incoming_path, err)),
        }

        let parsed = fs::read(&processing_path)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                serde_json::from_slice::<InboundMessage>(&raw).map_err(|err| err.to_string())
            });
        match parsed {
            Ok(payload) => batch.messages.push(ClaimedMessage {
                processing_path,
                payload,
            }),
            Err(_) => {
                fs::create_dir_all(&paths.failed).map_err(|e| io_err(&paths.failed, e))?;
                let target = paths.failed.join(file_name);
                fs::rename(&processing_path, &target).map_err(|e| io_err(&processing_path, e))?;
                batch.rejected.push(target);
            }
        }
    }
    Ok(batch)
}

pub fn complete(claimed: &ClaimedMessage) -> Result<(), InboxError> {
    match fs::remove_file(&claimed.processing_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(&claimed.processing_path, err)),
    }
}

/// Returns messages the previous host run claimed but never finished to
/// `incoming`, under fresh names.
pub fn recover_processing_entries(paths: &InboxPaths) -> Result<Vec<PathBuf>, InboxError> {
    let mut entries = Vec::new();
    let reader = match fs::read_dir(&paths.processing) {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(&paths.processing, err)),
    };
    for entry in reader {
        let entry = entry.map_err(|e| io_err(&paths.processing, e))?;
        let path = entry.path();
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    let mut recovered = Vec::new();
    for (index, processing_path) in entries.into_iter().enumerate() {
        let name = processing_path
            .file_name()
            .and_then(|v| v.to_str())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("message.json");
        let target = paths.incoming.join(recovered_filename(index, name));
        fs::rename(&processing_path, &target).map_err(|e| io_err(&processing_path, e))?;
        recovered.push(target);
    }
    Ok(recovered)
}

fn recovered_filename(index: usize, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("recovered_{index}_{hash}.json")
}

fn sorted_incoming_paths(incoming_dir: &Path) -> Result<Vec<PathBuf>, InboxError> {
    let mut entries = Vec::new();
    let reader = match fs::read_dir(incoming_dir) {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(incoming_dir, err)),
    };
    for entry in reader {
        let entry = entry.map_err(|e| io_err(incoming_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_hidden_name(name) || !name.ends_with(".json") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

fn io_err(path: &Path, source: std::io::Error) -> InboxError {
    InboxError::Io {
        path: path.display().to_string(),
        source,
    }
}
