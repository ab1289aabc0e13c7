//! Boundary to the external chat transport.

use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::random_base36;
use crate::shared::time::{now_millis, now_secs};
use crate::store::ChatRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid group metadata in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Unavailable(String),
}

pub trait ChatGateway: Send + Sync {
    fn send_message(&self, chat: &str, text: &str) -> Result<(), GatewayError>;

    /// Current group metadata as known to the transport.
    fn sync_groups(&self) -> Result<Vec<ChatRecord>, GatewayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxMessage {
    pub chat: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupMetadata {
    chat_id: String,
    #[serde(default)]
    name: String,
}

/// File-based gateway: the transport picks up `outbox/messages/*.json` and
/// publishes `outbox/groups.json`.
#[derive(Debug, Clone)]
pub struct OutboxGateway {
    messages_dir: PathBuf,
    groups_path: PathBuf,
}

impl OutboxGateway {
    pub fn new(messages_dir: impl Into<PathBuf>, groups_path: impl Into<PathBuf>) -> Self {
        Self {
            messages_dir: messages_dir.into(),
            groups_path: groups_path.into(),
        }
    }

    pub fn messages_dir(&self) -> &Path {
        &self.messages_dir
    }
}

impl ChatGateway for OutboxGateway {
    fn send_message(&self, chat: &str, text: &str) -> Result<(), GatewayError> {
        let suffix = random_base36(6).map_err(GatewayError::Unavailable)?;
        let path = self
            .messages_dir
            .join(format!("{}-{suffix}.json", now_millis()));
        let message = OutboxMessage {
            chat: chat.to_string(),
            text: text.to_string(),
            timestamp: now_secs(),
        };
        fs::create_dir_all(&self.messages_dir).map_err(|source| GatewayError::Io {
            path: self.messages_dir.display().to_string(),
            source,
        })?;
        atomic_write_json(&path, &message).map_err(|source| GatewayError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn sync_groups(&self) -> Result<Vec<ChatRecord>, GatewayError> {
        let raw = match fs::read(&self.groups_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(GatewayError::Io {
                    path: self.groups_path.display().to_string(),
                    source,
                })
            }
        };
        let groups: Vec<GroupMetadata> =
            serde_json::from_slice(&raw).map_err(|source| GatewayError::Parse {
                path: self.groups_path.display().to_string(),
                source,
            })?;
        Ok(groups
            .into_iter()
            .map(|group| ChatRecord {
                chat_id: group.chat_id,
                name: group.name,
                last_activity: 0,
            })
            .collect())
    }
}
