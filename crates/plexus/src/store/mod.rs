//! Stores the gateway consumes.
//!
//! The gateway owns no schema of its own; it reads and writes through these
//! traits. [`SqliteStore`] implements the persistent ones so the binary runs
//! stand-alone, and [`HttpWorkspaceClient`] talks to the workspace provisioner.

mod error;
mod sqlite;
mod workspace_client;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
pub use workspace_client::HttpWorkspaceClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plexus_protocol::bus::ChatUpdated;
use plexus_protocol::models::{Chat, ChatMessage, ChatType, ResourceUtil, User, Workspace, WorkspaceState};
use serde_json::Value;

// ============================================================================
// Requests and results
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewChatRequest {
    pub name: String,
    pub chat_type: ChatType,
    pub users: Vec<i64>,
}

/// Outcome of a create. `update` is `None` when an existing direct chat
/// between the same pair was returned instead of a new one.
#[derive(Debug, Clone)]
pub struct CreatedChat {
    pub chat: Chat,
    pub update: Option<ChatUpdated>,
}

#[derive(Debug, Clone, Default)]
pub struct EditChatRequest {
    pub chat_id: i64,
    pub name: Option<String>,
    pub add_users: Vec<i64>,
    pub remove_users: Vec<i64>,
}

/// Outcome of an edit or delete.
#[derive(Debug, Clone)]
pub struct ChatChange {
    /// The chat after the change. For a delete, the chat as it was.
    pub chat: Chat,
    pub update: ChatUpdated,
}

#[derive(Debug, Clone)]
pub struct NewMessageRequest {
    pub chat_id: i64,
    pub body: String,
    pub message_type: i32,
}

#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub chat_id: i64,
    /// Only messages created strictly before this instant.
    pub before: DateTime<Utc>,
    pub descending: bool,
    pub limit: i64,
}

/// Where to reach a workspace's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub workspace_id: i64,
    pub agent_id: i64,
    /// Base WebSocket URL, e.g. `ws://10.0.0.4:7000`.
    pub url: String,
    pub secret: String,
    pub workspace_state: WorkspaceState,
}

/// One client-side usage event, enriched by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct WebUsage {
    pub user_id: Option<i64>,
    pub ip: String,
    pub host: String,
    pub event: i32,
    pub path: String,
    /// Milliseconds on the page.
    pub timespent: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: i64) -> StoreResult<Option<User>>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Most recently active chats the user belongs to.
    async fn chats_for_user(&self, user_id: i64, offset: i64, limit: i64) -> StoreResult<Vec<Chat>>;

    async fn create_chat(&self, creator: &User, request: NewChatRequest) -> StoreResult<CreatedChat>;

    async fn update_chat(&self, editor: &User, request: EditChatRequest) -> StoreResult<ChatChange>;

    async fn delete_chat(&self, user: &User, chat_id: i64) -> StoreResult<ChatChange>;

    async fn send_message(&self, author: &User, request: NewMessageRequest) -> StoreResult<ChatMessage>;

    /// Closed chats require membership, and reading advances the reader's pointer.
    async fn get_messages(&self, reader: Option<&User>, query: MessageQuery) -> StoreResult<Vec<ChatMessage>>;

    /// The chat, only if it exists and is a challenge chat.
    async fn challenge_chat(&self, chat_id: i64) -> StoreResult<Option<Chat>>;

    async fn update_read(&self, user_id: i64, chat_id: i64, message_id: i64) -> StoreResult<()>;

    async fn set_mute(&self, user_id: i64, chat_id: i64, mute: bool) -> StoreResult<()>;
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Current status, scoped to the owner.
    async fn workspace_status(&self, owner_id: i64, workspace_id: i64) -> StoreResult<Option<Workspace>>;

    /// Id of the most recent running agent attached to the workspace.
    async fn running_agent(&self, workspace_id: i64) -> StoreResult<Option<i64>>;

    async fn agent_endpoint(&self, owner_id: i64, workspace_id: i64) -> StoreResult<Option<AgentEndpoint>>;

    async fn extend_expiration(&self, owner_id: i64, workspace_id: i64, until: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
pub trait WebUsageStore: Send + Sync {
    async fn record_usage(&self, usage: WebUsage) -> StoreResult<()>;
}

/// Live metrics from the workspace provisioner.
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    async fn get_resource_util(&self, workspace_id: i64, user_id: i64) -> StoreResult<ResourceUtil>;
}
