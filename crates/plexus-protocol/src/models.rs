//! Domain records as they appear on the wire and on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Users
// ============================================================================

/// An authenticated user. The gateway only reads users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "crate::ids")]
    pub id: i64,
    pub user_name: String,
    /// Renown tier, stamped onto every chat message the user sends.
    pub tier: i32,
}

// ============================================================================
// Chats
// ============================================================================

/// Chat kind. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChatType {
    Global = 0,
    Regional = 1,
    DirectMessage = 2,
    PrivateGroup = 3,
    PublicGroup = 4,
    Challenge = 5,
}

impl ChatType {
    /// Chats anyone may post to without being a member.
    pub fn is_open(self) -> bool {
        matches!(self, ChatType::Global | ChatType::Regional | ChatType::Challenge)
    }
}

impl From<ChatType> for u8 {
    fn from(value: ChatType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ChatType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ChatType::Global,
            1 => ChatType::Regional,
            2 => ChatType::DirectMessage,
            3 => ChatType::PrivateGroup,
            4 => ChatType::PublicGroup,
            5 => ChatType::Challenge,
            other => return Err(format!("unknown chat type {other}")),
        })
    }
}

/// Id of the synthetic global chat every connection listens to.
pub const GLOBAL_CHAT_ID: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(with = "crate::ids")]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(with = "crate::ids::vec", default)]
    pub users: Vec<i64>,
    #[serde(with = "crate::ids::option", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub muted: bool,
}

impl Chat {
    pub fn global() -> Self {
        Self {
            id: GLOBAL_CHAT_ID,
            name: "Global".to_string(),
            chat_type: ChatType::Global,
            users: Vec::new(),
            last_message: None,
            last_message_time: None,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(with = "crate::ids")]
    pub id: i64,
    #[serde(with = "crate::ids")]
    pub chat_id: i64,
    #[serde(with = "crate::ids")]
    pub author_id: i64,
    pub author: String,
    /// Author tier at send time, filled in by the server.
    pub author_renown: i32,
    pub body: String,
    #[serde(default)]
    pub message_type: i32,
    #[serde(default)]
    pub revision: i32,
    pub created_at: DateTime<Utc>,
}

/// What changed in a chat update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatUpdateKind {
    UserAdd,
    UserRemove,
    NameChange,
    Deleted,
}

// ============================================================================
// Workspaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitState {
    Provisioning,
    AgentConnecting,
    Completed,
    Failed,
}

impl InitState {
    pub fn as_str(self) -> &'static str {
        match self {
            InitState::Provisioning => "provisioning",
            InitState::AgentConnecting => "agent-connecting",
            InitState::Completed => "completed",
            InitState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "provisioning" => InitState::Provisioning,
            "agent-connecting" => InitState::AgentConnecting,
            "completed" => InitState::Completed,
            "failed" => InitState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl WorkspaceState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceState::Starting => "starting",
            WorkspaceState::Active => "active",
            WorkspaceState::Stopping => "stopping",
            WorkspaceState::Stopped => "stopped",
            WorkspaceState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "starting" => WorkspaceState::Starting,
            "active" => WorkspaceState::Active,
            "stopping" => WorkspaceState::Stopping,
            "stopped" => WorkspaceState::Stopped,
            "failed" => WorkspaceState::Failed,
            _ => return None,
        })
    }
}

/// A workspace as presented to its owner's browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(with = "crate::ids")]
    pub id: i64,
    #[serde(with = "crate::ids")]
    pub owner_id: i64,
    pub init_state: InitState,
    pub state: WorkspaceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

/// One resource-utilization sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtil {
    pub cpu: f64,
    pub memory: f64,
    pub cpu_limit: f64,
    pub memory_limit: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

impl ResourceUtil {
    /// Build a sample, deriving the normalized ratios from used and limit.
    pub fn new(cpu: f64, cpu_limit: f64, memory: f64, memory_limit: f64) -> Self {
        Self {
            cpu,
            memory,
            cpu_limit,
            memory_limit,
            cpu_usage: ratio(cpu, cpu_limit),
            memory_usage: ratio(memory, memory_limit),
        }
    }
}

fn ratio(used: f64, limit: f64) -> f64 {
    if limit > 0.0 { used / limit } else { 0.0 }
}
