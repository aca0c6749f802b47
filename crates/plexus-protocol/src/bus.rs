//! Bus subjects, bus records and the structured-binary codec.
//!
//! Records are CBOR encoded. CBOR carries field names, so consumers never
//! depend on field order and need no schema lookup.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::CodecError;
use crate::models::{Chat, ChatMessage, ChatUpdateKind, ResourceUtil, Workspace};

// ============================================================================
// Subjects
// ============================================================================

pub mod subjects {
    pub fn chat_messages(chat_id: i64) -> String {
        format!("chat.messages.{chat_id}")
    }

    pub fn new_chat(user_id: i64) -> String {
        format!("chat.new_chat.{user_id}")
    }

    pub fn chat_kick(user_id: i64) -> String {
        format!("chat.kick.{user_id}")
    }

    pub fn chat_updated(user_id: i64) -> String {
        format!("chat.updated.{user_id}")
    }

    pub fn workspace_status(workspace_id: i64) -> String {
        format!("workspace.status.{workspace_id}")
    }

    /// Split `prefix.<id>` back into its id. Returns `None` for other prefixes.
    pub fn parse_id(subject: &str, prefix: &str) -> Option<i64> {
        subject
            .strip_prefix(prefix)?
            .strip_prefix('.')?
            .parse()
            .ok()
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChat {
    pub chat: Chat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatKick {
    #[serde(with = "crate::ids")]
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatUpdated {
    #[serde(with = "crate::ids")]
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub update_events: Vec<ChatUpdateKind>,
    #[serde(with = "crate::ids::vec", default)]
    pub added_users: Vec<i64>,
    #[serde(with = "crate::ids::vec", default)]
    pub removed_users: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    /// User name of whoever made the change.
    #[serde(default)]
    pub updater: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceStatusUpdate {
    pub workspace: Workspace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUtil>,
}

// ============================================================================
// Codec
// ============================================================================

pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(record, &mut buf).map_err(|e| CodecError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(raw).map_err(|e| CodecError::CborDecode(e.to_string()))
}
