use crate::scheduler::ContextMode;
use serde::{Deserialize, Serialize};

/// Contents of a file in `ipc/{tenant}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingRequest {
    pub target_chat: String,
    pub body: String,
}

/// Contents of a file in `ipc/{tenant}/tasks`, discriminated by `op`.
///
/// Nothing in a request identifies the requester; that always comes from the
/// directory the file was found in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskRequest {
    Schedule {
        prompt: String,
        schedule_kind: String,
        schedule_value: String,
        #[serde(default)]
        target_chat: Option<String>,
        #[serde(default)]
        context_mode: Option<ContextMode>,
    },
    Pause {
        task_id: String,
    },
    Resume {
        task_id: String,
    },
    Cancel {
        task_id: String,
    },
    RefreshGroups,
    RegisterGroup {
        tenant_id: String,
        name: String,
        chat: String,
    },
}

impl TaskRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Schedule { .. } => "schedule",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Cancel { .. } => "cancel",
            Self::RefreshGroups => "refresh_groups",
            Self::RegisterGroup { .. } => "register_group",
        }
    }
}
