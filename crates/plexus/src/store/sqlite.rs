//! SQLite implementation of the persistent stores.

use std::collections::BTreeSet;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use plexus_protocol::bus::ChatUpdated;
use plexus_protocol::models::{
    Chat, ChatMessage, ChatType, ChatUpdateKind, InitState, User, Workspace, WorkspaceState,
};

use super::{
    AgentEndpoint, ChatChange, ChatStore, CreatedChat, EditChatRequest, MessageQuery,
    NewChatRequest, NewMessageRequest, StoreError, StoreResult, UserStore, WebUsage,
    WebUsageStore, WorkspaceStore,
};

/// Store backed by the gateway's SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct ChatRow {
    id: i64,
    name: String,
    chat_type: i64,
    last_message: Option<i64>,
    last_message_time: Option<i64>,
    muted: bool,
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    author_id: i64,
    author: String,
    author_renown: i32,
    body: String,
    message_type: i32,
    revision: i32,
    created_at: i64,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: row.id,
            chat_id: row.chat_id,
            author_id: row.author_id,
            author: row.author,
            author_renown: row.author_renown,
            body: row.body,
            message_type: row.message_type,
            revision: row.revision,
            created_at: from_millis(row.created_at),
        }
    }
}

#[derive(FromRow)]
struct WorkspaceRow {
    id: i64,
    owner_id: i64,
    init_state: String,
    state: String,
    expiration: Option<i64>,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = StoreError;

    fn try_from(row: WorkspaceRow) -> Result<Self, Self::Error> {
        Ok(Workspace {
            id: row.id,
            owner_id: row.owner_id,
            init_state: InitState::parse(&row.init_state)
                .ok_or_else(|| anyhow!("unknown init state {:?}", row.init_state))?,
            state: parse_workspace_state(&row.state)?,
            expiration: row.expiration.map(from_millis),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_workspace_state(raw: &str) -> StoreResult<WorkspaceState> {
    WorkspaceState::parse(raw).ok_or_else(|| anyhow!("unknown workspace state {raw:?}").into())
}

fn chat_type(raw: i64) -> StoreResult<ChatType> {
    u8::try_from(raw)
        .map_err(|_| anyhow!("chat type {raw} out of range"))
        .and_then(|code| ChatType::try_from(code).map_err(|e| anyhow!(e)))
        .map_err(StoreError::from)
}

const CHAT_COLUMNS: &str = "c.id, c.name, c.chat_type, c.last_message, c.last_message_time";

const MESSAGE_COLUMNS: &str =
    "id, chat_id, author_id, author, author_renown, body, message_type, revision, created_at";

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn members(
        tx: &mut Transaction<'_, Sqlite>,
        chat_id: i64,
    ) -> StoreResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM chat_users WHERE chat_id = ? ORDER BY user_id")
                .bind(chat_id)
                .fetch_all(&mut **tx)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn is_member(
        tx: &mut Transaction<'_, Sqlite>,
        chat_id: i64,
        user_id: i64,
    ) -> StoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM chat_users WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id)
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(row.is_some())
    }

    async fn load_chat(
        tx: &mut Transaction<'_, Sqlite>,
        chat_id: i64,
    ) -> StoreResult<Option<Chat>> {
        let row: Option<ChatRow> = sqlx::query_as(&format!(
            "SELECT {CHAT_COLUMNS}, 0 AS muted FROM chats c WHERE c.id = ?"
        ))
        .bind(chat_id)
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => {
                let users = Self::members(tx, chat_id).await?;
                Ok(Some(Self::chat_from_row(row, users)?))
            }
            None => Ok(None),
        }
    }

    fn chat_from_row(row: ChatRow, users: Vec<i64>) -> StoreResult<Chat> {
        Ok(Chat {
            id: row.id,
            name: row.name,
            chat_type: chat_type(row.chat_type)?,
            users,
            last_message: row.last_message,
            last_message_time: row.last_message_time.map(from_millis),
            muted: row.muted,
        })
    }

    async fn require_member(
        tx: &mut Transaction<'_, Sqlite>,
        chat_id: i64,
        user_id: i64,
    ) -> StoreResult<()> {
        if Self::is_member(tx, chat_id, user_id).await? {
            Ok(())
        } else {
            Err(StoreError::Forbidden("you are not a member of this chat".to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Seeding helpers used by `plexus init` fixtures and tests.
    // ------------------------------------------------------------------

    pub async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, user_name, tier) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET user_name = excluded.user_name, tier = excluded.tier",
        )
        .bind(user.id)
        .bind(&user.user_name)
        .bind(user.tier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a chat with a fixed id and member list.
    pub async fn insert_chat(&self, id: i64, name: &str, chat_type: ChatType, users: &[i64]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chats (id, name, chat_type, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(u8::from(chat_type) as i64)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        for user in users {
            sqlx::query("INSERT OR IGNORE INTO chat_users (chat_id, user_id) VALUES (?, ?)")
                .bind(id)
                .bind(user)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_workspace(&self, workspace: &Workspace) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workspaces (id, owner_id, init_state, state, expiration) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET owner_id = excluded.owner_id, init_state = excluded.init_state,
                state = excluded.state, expiration = excluded.expiration",
        )
        .bind(workspace.id)
        .bind(workspace.owner_id)
        .bind(workspace.init_state.as_str())
        .bind(workspace.state.as_str())
        .bind(workspace.expiration.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach a running agent to a workspace and return its id.
    pub async fn attach_agent(&self, workspace_id: i64, url: &str, secret: &str) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO workspace_agents (workspace_id, state, url, secret, created_at) VALUES (?, 'running', ?, ?, ?)",
        )
        .bind(workspace_id)
        .bind(url)
        .bind(secret)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    #[instrument(skip(self))]
    async fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        let row: Option<(i64, String, i32)> =
            sqlx::query_as("SELECT id, user_name, tier FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, user_name, tier)| User { id, user_name, tier }))
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    #[instrument(skip(self))]
    async fn chats_for_user(&self, user_id: i64, offset: i64, limit: i64) -> StoreResult<Vec<Chat>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<ChatRow> = sqlx::query_as(&format!(
            "SELECT {CHAT_COLUMNS}, cu.muted AS muted
             FROM chats c JOIN chat_users cu ON cu.chat_id = c.id
             WHERE cu.user_id = ?
             ORDER BY COALESCE(c.last_message_time, c.created_at) DESC, c.id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *tx)
        .await?;

        let mut chats = Vec::with_capacity(rows.len());
        for row in rows {
            let users = Self::members(&mut tx, row.id).await?;
            chats.push(Self::chat_from_row(row, users)?);
        }
        tx.commit().await?;
        Ok(chats)
    }

    #[instrument(skip(self, creator, request), fields(creator = creator.id))]
    async fn create_chat(&self, creator: &User, request: NewChatRequest) -> StoreResult<CreatedChat> {
        let mut users: BTreeSet<i64> = request.users.into_iter().collect();
        users.insert(creator.id);
        let users: Vec<i64> = users.into_iter().collect();

        if users.len() < 2 {
            return Err(StoreError::Invalid("chat must have at least two users".to_string()));
        }
        if users.len() == 2 && request.chat_type != ChatType::DirectMessage {
            return Err(StoreError::Invalid(
                "chat type must be direct message for two users".to_string(),
            ));
        }
        if users.len() > 2 && request.chat_type != ChatType::PrivateGroup {
            return Err(StoreError::Invalid(
                "chat type must be group for more than two users".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        if request.chat_type == ChatType::DirectMessage {
            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT c.id FROM chats c
                 WHERE c.chat_type = ?
                   AND EXISTS (SELECT 1 FROM chat_users WHERE chat_id = c.id AND user_id = ?)
                   AND EXISTS (SELECT 1 FROM chat_users WHERE chat_id = c.id AND user_id = ?)
                 LIMIT 1",
            )
            .bind(u8::from(ChatType::DirectMessage) as i64)
            .bind(users[0])
            .bind(users[1])
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((chat_id,)) = existing {
                debug!(chat_id, "returning existing direct chat");
                let chat = Self::load_chat(&mut tx, chat_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
                return Ok(CreatedChat { chat, update: None });
            }
        }

        let now = Utc::now().timestamp_millis();
        let chat_id = sqlx::query("INSERT INTO chats (name, chat_type, created_at) VALUES (?, ?, ?)")
            .bind(&request.name)
            .bind(u8::from(request.chat_type) as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for user in &users {
            sqlx::query("INSERT INTO chat_users (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(user)
                .execute(&mut *tx)
                .await?;
        }

        let chat = Self::load_chat(&mut tx, chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        tx.commit().await?;

        let update = ChatUpdated {
            chat_id,
            chat: Some(chat.clone()),
            update_events: vec![ChatUpdateKind::UserAdd],
            added_users: users,
            removed_users: Vec::new(),
            old_name: None,
            updater: creator.user_name.clone(),
        };
        Ok(CreatedChat {
            chat,
            update: Some(update),
        })
    }

    #[instrument(skip(self, editor, request), fields(editor = editor.id, chat_id = request.chat_id))]
    async fn update_chat(&self, editor: &User, request: EditChatRequest) -> StoreResult<ChatChange> {
        let chat_id = request.chat_id;
        let mut tx = self.pool.begin().await?;

        let before = Self::load_chat(&mut tx, chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        Self::require_member(&mut tx, chat_id, editor.id).await?;

        let current: BTreeSet<i64> = before.users.iter().copied().collect();

        let added: Vec<i64> = request
            .add_users
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();

        let removed: Vec<i64> = request
            .remove_users
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| *id != editor.id && current.contains(id))
            .collect();

        for user in &added {
            sqlx::query("INSERT INTO chat_users (chat_id, user_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(user)
                .execute(&mut *tx)
                .await?;
        }
        for user in &removed {
            sqlx::query("DELETE FROM chat_users WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id)
                .bind(user)
                .execute(&mut *tx)
                .await?;
        }

        let mut update_events = Vec::new();
        if !added.is_empty() {
            update_events.push(ChatUpdateKind::UserAdd);
        }
        if !removed.is_empty() {
            update_events.push(ChatUpdateKind::UserRemove);
        }

        let mut old_name = None;
        if let Some(name) = request.name.filter(|name| !name.is_empty()) {
            sqlx::query("UPDATE chats SET name = ? WHERE id = ?")
                .bind(&name)
                .bind(chat_id)
                .execute(&mut *tx)
                .await?;
            old_name = Some(before.name.clone());
            update_events.push(ChatUpdateKind::NameChange);
        }

        let chat = Self::load_chat(&mut tx, chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        tx.commit().await?;

        Ok(ChatChange {
            update: ChatUpdated {
                chat_id,
                chat: Some(chat.clone()),
                update_events,
                added_users: added,
                removed_users: removed,
                old_name,
                updater: editor.user_name.clone(),
            },
            chat,
        })
    }

    #[instrument(skip(self, user), fields(user_id = user.id))]
    async fn delete_chat(&self, user: &User, chat_id: i64) -> StoreResult<ChatChange> {
        let mut tx = self.pool.begin().await?;

        let chat = Self::load_chat(&mut tx, chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        Self::require_member(&mut tx, chat_id, user.id).await?;

        sqlx::query("DELETE FROM chat_messages WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chat_users WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ChatChange {
            update: ChatUpdated {
                chat_id,
                chat: Some(chat.clone()),
                update_events: vec![ChatUpdateKind::Deleted],
                added_users: Vec::new(),
                removed_users: chat.users.clone(),
                old_name: None,
                updater: user.user_name.clone(),
            },
            chat,
        })
    }

    #[instrument(skip(self, author, request), fields(author = author.id, chat_id = request.chat_id))]
    async fn send_message(&self, author: &User, request: NewMessageRequest) -> StoreResult<ChatMessage> {
        let chat_id = request.chat_id;
        let mut tx = self.pool.begin().await?;

        let (raw_type,): (i64,) = sqlx::query_as("SELECT chat_type FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let kind = chat_type(raw_type)?;
        if !kind.is_open() {
            Self::require_member(&mut tx, chat_id, author.id).await?;
        }

        let created_at = Utc::now();
        let message_id = sqlx::query(
            "INSERT INTO chat_messages (chat_id, author_id, author, author_renown, body, message_type, revision, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(chat_id)
        .bind(author.id)
        .bind(&author.user_name)
        .bind(author.tier)
        .bind(&request.body)
        .bind(request.message_type)
        .bind(created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE chats SET last_message = ?, last_message_time = ? WHERE id = ?")
            .bind(message_id)
            .bind(created_at.timestamp_millis())
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        if !kind.is_open() {
            sqlx::query("UPDATE chat_users SET last_read_message = ? WHERE chat_id = ? AND user_id = ?")
                .bind(message_id)
                .bind(chat_id)
                .bind(author.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ChatMessage {
            id: message_id,
            chat_id,
            author_id: author.id,
            author: author.user_name.clone(),
            author_renown: author.tier,
            body: request.body,
            message_type: request.message_type,
            revision: 0,
            created_at: from_millis(created_at.timestamp_millis()),
        })
    }

    #[instrument(skip(self, reader), fields(chat_id = query.chat_id))]
    async fn get_messages(&self, reader: Option<&User>, query: MessageQuery) -> StoreResult<Vec<ChatMessage>> {
        let chat_id = query.chat_id;
        let mut tx = self.pool.begin().await?;

        let (raw_type,): (i64,) = sqlx::query_as("SELECT chat_type FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))?;
        let closed = !chat_type(raw_type)?.is_open();

        let mut last_read = None;
        if closed {
            let reader = reader.ok_or_else(|| {
                StoreError::Forbidden("you are not a member of this chat".to_string())
            })?;
            let row: Option<(Option<i64>,)> = sqlx::query_as(
                "SELECT last_read_message FROM chat_users WHERE chat_id = ? AND user_id = ?",
            )
            .bind(chat_id)
            .bind(reader.id)
            .fetch_optional(&mut *tx)
            .await?;
            let (pointer,) = row.ok_or_else(|| {
                StoreError::Forbidden("you are not a member of this chat".to_string())
            })?;
            last_read = pointer;
        }

        let order = if query.descending { "DESC" } else { "ASC" };
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE chat_id = ? AND created_at < ?
             ORDER BY created_at {order}, id {order}
             LIMIT ?"
        ))
        .bind(chat_id)
        .bind(query.before.timestamp_millis())
        .bind(query.limit)
        .fetch_all(&mut *tx)
        .await?;

        let highest = rows.iter().map(|row| row.id).max();
        if let (true, Some(reader), Some(highest)) = (closed, reader, highest) {
            if last_read.is_none_or(|current| highest > current) {
                sqlx::query(
                    "UPDATE chat_users SET last_read_message = ? WHERE chat_id = ? AND user_id = ?",
                )
                .bind(highest)
                .bind(chat_id)
                .bind(reader.id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    #[instrument(skip(self))]
    async fn challenge_chat(&self, chat_id: i64) -> StoreResult<Option<Chat>> {
        let mut tx = self.pool.begin().await?;
        let chat = Self::load_chat(&mut tx, chat_id).await?;
        tx.commit().await?;
        Ok(chat.filter(|chat| chat.chat_type == ChatType::Challenge))
    }

    #[instrument(skip(self))]
    async fn update_read(&self, user_id: i64, chat_id: i64, message_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE chat_users SET last_read_message = ? WHERE chat_id = ? AND user_id = ?",
        )
        .bind(message_id)
        .bind(chat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("membership in chat {chat_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_mute(&self, user_id: i64, chat_id: i64, mute: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE chat_users SET muted = ? WHERE chat_id = ? AND user_id = ?")
            .bind(mute)
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("membership in chat {chat_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceStore for SqliteStore {
    #[instrument(skip(self))]
    async fn workspace_status(&self, owner_id: i64, workspace_id: i64) -> StoreResult<Option<Workspace>> {
        let row: Option<WorkspaceRow> = sqlx::query_as(
            "SELECT id, owner_id, init_state, state, expiration FROM workspaces WHERE id = ? AND owner_id = ?",
        )
        .bind(workspace_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workspace::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn running_agent(&self, workspace_id: i64) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM workspace_agents WHERE workspace_id = ? AND state = 'running' ORDER BY id DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    #[instrument(skip(self))]
    async fn agent_endpoint(&self, owner_id: i64, workspace_id: i64) -> StoreResult<Option<AgentEndpoint>> {
        let row: Option<(i64, i64, String, String, String)> = sqlx::query_as(
            "SELECT w.id, wa.id, wa.url, wa.secret, w.state
             FROM workspaces w JOIN workspace_agents wa ON wa.workspace_id = w.id
             WHERE w.id = ? AND w.owner_id = ?
             ORDER BY wa.id DESC LIMIT 1",
        )
        .bind(workspace_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(workspace_id, agent_id, url, secret, state)| {
            Ok(AgentEndpoint {
                workspace_id,
                agent_id,
                url,
                secret,
                workspace_state: parse_workspace_state(&state)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn extend_expiration(&self, owner_id: i64, workspace_id: i64, until: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workspaces SET expiration = ?
             WHERE id = ? AND owner_id = ? AND state IN ('starting', 'active')",
        )
        .bind(until.timestamp_millis())
        .bind(workspace_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WebUsageStore for SqliteStore {
    #[instrument(skip(self, usage), fields(host = %usage.host, path = %usage.path))]
    async fn record_usage(&self, usage: WebUsage) -> StoreResult<()> {
        let metadata = usage
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Invalid(format!("metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO web_tracking (user_id, ip, host, event, path, timespent, latitude, longitude, metadata, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(usage.user_id)
        .bind(&usage.ip)
        .bind(&usage.host)
        .bind(usage.event)
        .bind(&usage.path)
        .bind(usage.timespent)
        .bind(usage.latitude)
        .bind(usage.longitude)
        .bind(metadata)
        .bind(usage.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use plexus_protocol::models::GLOBAL_CHAT_ID;

    fn user(id: i64, tier: i32) -> User {
        User {
            id,
            user_name: format!("user{id}"),
            tier,
        }
    }

    async fn store() -> SqliteStore {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteStore::new(db.pool().clone());
        for id in 1..=4 {
            store.upsert_user(&user(id, id as i32)).await.unwrap();
        }
        store
    }

    fn dm(users: Vec<i64>) -> NewChatRequest {
        NewChatRequest {
            name: "dm".into(),
            chat_type: ChatType::DirectMessage,
            users,
        }
    }

    #[tokio::test]
    async fn create_adds_creator_and_dedupes() {
        let store = store().await;
        let created = store.create_chat(&user(1, 1), dm(vec![2, 2, 1])).await.unwrap();
        assert_eq!(created.chat.users, vec![1, 2]);
        let update = created.update.unwrap();
        assert_eq!(update.added_users, vec![1, 2]);
        assert_eq!(update.updater, "user1");
    }

    #[tokio::test]
    async fn create_enforces_type_for_member_count() {
        let store = store().await;
        let lonely = store.create_chat(&user(1, 1), dm(vec![1])).await;
        assert!(matches!(lonely, Err(StoreError::Invalid(_))));

        let group_as_dm = store.create_chat(&user(1, 1), dm(vec![2, 3])).await;
        assert!(matches!(group_as_dm, Err(StoreError::Invalid(_))));

        let pair_as_group = store
            .create_chat(
                &user(1, 1),
                NewChatRequest {
                    name: "g".into(),
                    chat_type: ChatType::PrivateGroup,
                    users: vec![2],
                },
            )
            .await;
        assert!(matches!(pair_as_group, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn existing_direct_chat_is_returned_without_update() {
        let store = store().await;
        let first = store.create_chat(&user(1, 1), dm(vec![2])).await.unwrap();
        let second = store.create_chat(&user(2, 2), dm(vec![1])).await.unwrap();
        assert_eq!(first.chat.id, second.chat.id);
        assert!(second.update.is_none());
    }

    #[tokio::test]
    async fn update_reports_truly_removed_users() {
        let store = store().await;
        let chat = store
            .create_chat(
                &user(1, 1),
                NewChatRequest {
                    name: "g".into(),
                    chat_type: ChatType::PrivateGroup,
                    users: vec![2, 3],
                },
            )
            .await
            .unwrap()
            .chat;

        let change = store
            .update_chat(
                &user(1, 1),
                EditChatRequest {
                    chat_id: chat.id,
                    name: Some("renamed".into()),
                    add_users: vec![4, 2],
                    remove_users: vec![3, 99, 1],
                },
            )
            .await
            .unwrap();

        assert_eq!(change.update.added_users, vec![4]);
        assert_eq!(change.update.removed_users, vec![3]);
        assert_eq!(change.update.old_name.as_deref(), Some("g"));
        assert_eq!(change.chat.users, vec![1, 2, 4]);
        assert_eq!(change.chat.name, "renamed");
        assert!(change.update.update_events.contains(&ChatUpdateKind::NameChange));
    }

    #[tokio::test]
    async fn non_members_cannot_edit_delete_or_post() {
        let store = store().await;
        let chat = store.create_chat(&user(1, 1), dm(vec![2])).await.unwrap().chat;
        let outsider = user(3, 3);

        let edit = store
            .update_chat(&outsider, EditChatRequest { chat_id: chat.id, ..Default::default() })
            .await;
        assert!(matches!(edit, Err(StoreError::Forbidden(_))));
        assert!(matches!(store.delete_chat(&outsider, chat.id).await, Err(StoreError::Forbidden(_))));
        let post = store
            .send_message(
                &outsider,
                NewMessageRequest { chat_id: chat.id, body: "hi".into(), message_type: 0 },
            )
            .await;
        assert!(matches!(post, Err(StoreError::Forbidden(_))));
    }

    #[tokio::test]
    async fn global_chat_accepts_anyone_and_stamps_renown() {
        let store = store().await;
        let message = store
            .send_message(
                &user(3, 3),
                NewMessageRequest { chat_id: GLOBAL_CHAT_ID, body: "hello".into(), message_type: 0 },
            )
            .await
            .unwrap();
        assert_eq!(message.author_renown, 3);
        assert_eq!(message.chat_id, GLOBAL_CHAT_ID);
    }

    #[tokio::test]
    async fn get_messages_respects_order_and_membership() {
        let store = store().await;
        let chat = store.create_chat(&user(1, 1), dm(vec![2])).await.unwrap().chat;
        for body in ["a", "b", "c"] {
            store
                .send_message(
                    &user(1, 1),
                    NewMessageRequest { chat_id: chat.id, body: body.into(), message_type: 0 },
                )
                .await
                .unwrap();
        }
        let query = MessageQuery {
            chat_id: chat.id,
            before: Utc::now() + chrono::Duration::seconds(1),
            descending: true,
            limit: 2,
        };

        let messages = store.get_messages(Some(&user(2, 2)), query.clone()).await.unwrap();
        let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["c", "b"]);

        let anonymous = store.get_messages(None, query.clone()).await;
        assert!(matches!(anonymous, Err(StoreError::Forbidden(_))));
        let outsider = store.get_messages(Some(&user(3, 3)), query).await;
        assert!(matches!(outsider, Err(StoreError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_lists_former_members() {
        let store = store().await;
        let chat = store.create_chat(&user(1, 1), dm(vec![2])).await.unwrap().chat;
        let change = store.delete_chat(&user(2, 2), chat.id).await.unwrap();
        assert_eq!(change.update.removed_users, vec![1, 2]);
        assert_eq!(change.update.update_events, vec![ChatUpdateKind::Deleted]);
        assert!(store.challenge_chat(chat.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn challenge_lookup_only_matches_challenges() {
        let store = store().await;
        store.insert_chat(500, "puzzle", ChatType::Challenge, &[]).await.unwrap();
        assert_eq!(store.challenge_chat(500).await.unwrap().unwrap().name, "puzzle");
        assert!(store.challenge_chat(GLOBAL_CHAT_ID).await.unwrap().is_none());
        assert!(store.challenge_chat(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_pointer_and_mute_need_membership() {
        let store = store().await;
        let chat = store.create_chat(&user(1, 1), dm(vec![2])).await.unwrap().chat;
        store.update_read(2, chat.id, 10).await.unwrap();
        store.set_mute(2, chat.id, true).await.unwrap();
        let chats = store.chats_for_user(2, 0, 10).await.unwrap();
        assert!(chats[0].muted);
        assert!(matches!(store.set_mute(3, chat.id, true).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn workspace_lookups() {
        let store = store().await;
        store
            .upsert_workspace(&Workspace {
                id: 9,
                owner_id: 1,
                init_state: InitState::AgentConnecting,
                state: WorkspaceState::Starting,
                expiration: None,
            })
            .await
            .unwrap();

        assert!(store.workspace_status(2, 9).await.unwrap().is_none());
        let ws = store.workspace_status(1, 9).await.unwrap().unwrap();
        assert_eq!(ws.init_state, InitState::AgentConnecting);

        assert!(store.running_agent(9).await.unwrap().is_none());
        assert!(store.agent_endpoint(1, 9).await.unwrap().is_none());
        let agent = store.attach_agent(9, "ws://127.0.0.1:1", "s3cret").await.unwrap();
        assert_eq!(store.running_agent(9).await.unwrap(), Some(agent));

        let endpoint = store.agent_endpoint(1, 9).await.unwrap().unwrap();
        assert_eq!(endpoint.secret, "s3cret");
        assert_eq!(endpoint.workspace_state, WorkspaceState::Starting);

        let until = Utc::now() + chrono::Duration::minutes(10);
        store.extend_expiration(1, 9, until).await.unwrap();
        let ws = store.workspace_status(1, 9).await.unwrap().unwrap();
        assert_eq!(ws.expiration.map(|t| t.timestamp_millis()), Some(until.timestamp_millis()));
    }

    #[tokio::test]
    async fn usage_is_recorded() {
        let store = store().await;
        store
            .record_usage(WebUsage {
                user_id: Some(1),
                ip: "10.0.0.1".into(),
                host: "example.test".into(),
                event: 2,
                path: "/home".into(),
                timespent: Some(1500),
                latitude: None,
                longitude: None,
                metadata: Some(serde_json::json!({"ref": "nav"})),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM web_tracking")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
