//! Chat delivery for one connection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{Instrument, Span, debug, warn};

use plexus_protocol::bus::{ChatKick, ChatUpdated, NewChat, NewMessage, subjects};
use plexus_protocol::models::{Chat, ChatMessage, ChatType, GLOBAL_CHAT_ID, User};
use plexus_protocol::{Envelope, MessageType};

use super::params::{
    ChatIdParams, EditChatParams, GetChatsParams, GetMessagesParams, MuteParams, NewChatParams,
    SendMessageParams, SubscribeParams, UpdateReadParams,
};
use crate::bus::{self, BusResult, Delivery, EventBus, EventPublisher, Handler, SubscribeOptions, Subscription};
use crate::store::{ChatStore, EditChatRequest, MessageQuery, NewChatRequest, NewMessageRequest};
use crate::ws::{
    Connection, FrameError, Outbound, Plugin, PluginContext, PluginFactory, parse_id, parse_ids, parse_payload,
};

// ============================================================================
// Replies
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatIdReply {
    #[serde(with = "plexus_protocol::ids")]
    chat_id: i64,
}

#[derive(Debug, Serialize)]
struct MessageIdReply {
    #[serde(with = "plexus_protocol::ids")]
    message_id: i64,
}

#[derive(Debug, Serialize)]
struct ChatReply<'a> {
    chat: &'a Chat,
}

#[derive(Debug, Serialize)]
struct ChatsReply {
    chats: Vec<Chat>,
}

#[derive(Debug, Serialize)]
struct MessagesReply {
    messages: Vec<ChatMessage>,
}

// ============================================================================
// Factory
// ============================================================================

pub struct ChatPluginFactory {
    chats: Arc<dyn ChatStore>,
    publisher: EventPublisher,
    initial_chat_limit: i64,
}

impl ChatPluginFactory {
    pub fn new(chats: Arc<dyn ChatStore>, publisher: EventPublisher, initial_chat_limit: i64) -> Self {
        Self {
            chats,
            publisher,
            initial_chat_limit,
        }
    }
}

#[async_trait]
impl PluginFactory for ChatPluginFactory {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn create(&self, ctx: PluginContext) -> anyhow::Result<Arc<dyn Plugin>> {
        let user = ctx.conn.user().load();

        let mut chats = match &user {
            Some(user) => self
                .chats
                .chats_for_user(user.id, 0, self.initial_chat_limit)
                .await
                .context("failed to load chats")?,
            None => Vec::new(),
        };
        if !chats.iter().any(|chat| chat.id == GLOBAL_CHAT_ID) {
            chats.push(Chat::global());
        }

        let shared = Arc::new(Shared {
            conn: ctx.conn,
            outbound: ctx.outbound,
            bus: self.publisher.bus().clone(),
            state: Mutex::new(ChatState::default()),
        });

        for chat in chats {
            let chat_id = chat.id;
            shared
                .subscribe_chat(chat)
                .await
                .with_context(|| format!("failed to subscribe to chat {chat_id}"))?;
        }

        let mut user_streams = Vec::new();
        if let Some(user) = &user {
            let streams: [(String, Handler); 3] = [
                (subjects::new_chat(user.id), new_chat_handler(Arc::downgrade(&shared))),
                (subjects::chat_kick(user.id), kick_handler(Arc::downgrade(&shared))),
                (subjects::chat_updated(user.id), updated_handler(Arc::downgrade(&shared))),
            ];
            for (subject, handler) in streams {
                let sub = shared
                    .bus
                    .subscribe(&subject, SubscribeOptions::default(), handler)
                    .await
                    .with_context(|| format!("failed to subscribe to {subject}"))?;
                user_streams.push(sub);
            }
        }

        let subscribed = shared.state.lock().await.subs.len();
        debug!(chats = subscribed, user_streams = user_streams.len(), "chat plugin ready");

        Ok(Arc::new(ChatPlugin {
            shared,
            chats: self.chats.clone(),
            publisher: self.publisher.clone(),
            user_streams: Mutex::new(user_streams),
        }))
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct ChatState {
    subs: HashMap<i64, Subscription>,
    chats: HashMap<i64, Chat>,
}

impl ChatState {
    fn remove(&mut self, chat_id: i64) -> Option<Chat> {
        // Dropping the subscription unsubscribes it.
        self.subs.remove(&chat_id);
        self.chats.remove(&chat_id)
    }
}

/// The part of the plugin bus handlers can reach. Handlers hold it weakly.
struct Shared {
    conn: Connection,
    outbound: Outbound,
    bus: Arc<dyn EventBus>,
    state: Mutex<ChatState>,
}

impl Shared {
    /// Subscribe to a chat's messages. Returns `false` if already subscribed.
    async fn subscribe_chat(self: &Arc<Self>, chat: Chat) -> BusResult<bool> {
        let mut state = self.state.lock().await;
        if state.subs.contains_key(&chat.id) {
            return Ok(false);
        }
        let sub = self
            .bus
            .subscribe(
                &subjects::chat_messages(chat.id),
                SubscribeOptions::default(),
                message_handler(Arc::downgrade(self)),
            )
            .await?;
        state.subs.insert(chat.id, sub);
        state.chats.insert(chat.id, chat);
        Ok(true)
    }

    async fn unsubscribe_chat(&self, chat_id: i64) -> Option<Chat> {
        self.state.lock().await.remove(chat_id)
    }
}

/// Wrap a bus callback: ack, upgrade the weak reference, and run inside the
/// connection's span.
fn plugin_handler<F, Fut>(shared: Weak<Shared>, f: F) -> Handler
where
    F: Fn(Arc<Shared>, Delivery) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let span = Span::current();
    let f = Arc::new(f);
    bus::handler(move |delivery: Delivery| {
        delivery.ack();
        let shared = shared.upgrade();
        let f = f.clone();
        async move {
            if let Some(shared) = shared {
                f(shared, delivery).await;
            }
        }
        .instrument(span.clone())
    })
}

fn message_handler(shared: Weak<Shared>) -> Handler {
    plugin_handler(shared, |shared, delivery| async move {
        let record: NewMessage = match delivery.decode() {
            Ok(record) => record,
            Err(err) => {
                warn!(subject = delivery.subject(), error = %err, "failed to decode chat message");
                return;
            }
        };
        // The sender already got a synchronous echo.
        if shared.conn.user().id() == Some(record.message.author_id) {
            return;
        }
        shared
            .outbound
            .push(MessageType::ChatIncomingMessage, &record.message)
            .await;
    })
}

fn new_chat_handler(shared: Weak<Shared>) -> Handler {
    plugin_handler(shared, |shared, delivery| async move {
        let record: NewChat = match delivery.decode() {
            Ok(record) => record,
            Err(err) => {
                warn!(subject = delivery.subject(), error = %err, "failed to decode new chat");
                return;
            }
        };
        let chat = record.chat;
        match shared.subscribe_chat(chat.clone()).await {
            Ok(true) => shared.outbound.push(MessageType::ChatNewBroadcast, &chat).await,
            Ok(false) => debug!(chat_id = chat.id, "already subscribed to new chat"),
            Err(err) => warn!(chat_id = chat.id, error = %err, "failed to subscribe to new chat"),
        }
    })
}

fn kick_handler(shared: Weak<Shared>) -> Handler {
    plugin_handler(shared, |shared, delivery| async move {
        let record: ChatKick = match delivery.decode() {
            Ok(record) => record,
            Err(err) => {
                warn!(subject = delivery.subject(), error = %err, "failed to decode chat kick");
                return;
            }
        };
        debug!(chat_id = record.chat_id, "kicked from chat");
        shared
            .outbound
            .push(MessageType::ChatKick, ChatIdReply { chat_id: record.chat_id })
            .await;
        shared.unsubscribe_chat(record.chat_id).await;
    })
}

fn updated_handler(shared: Weak<Shared>) -> Handler {
    plugin_handler(shared, |shared, delivery| async move {
        let record: ChatUpdated = match delivery.decode() {
            Ok(record) => record,
            Err(err) => {
                warn!(subject = delivery.subject(), error = %err, "failed to decode chat update");
                return;
            }
        };
        shared.outbound.push(MessageType::ChatUpdatedEvent, &record).await;
    })
}

// ============================================================================
// Plugin
// ============================================================================

pub struct ChatPlugin {
    shared: Arc<Shared>,
    chats: Arc<dyn ChatStore>,
    publisher: EventPublisher,
    user_streams: Mutex<Vec<Subscription>>,
}

#[async_trait]
impl Plugin for ChatPlugin {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn handle(&self, frame: &Envelope) -> Result<(), FrameError> {
        let user = self.shared.conn.user().load();
        match frame.message_type {
            MessageType::ChatGetMessages => self.get_messages(frame, user.as_ref()).await,
            MessageType::ChatSubscribe => self.subscribe(frame).await,
            MessageType::ChatUnsubscribe => self.unsubscribe(frame).await,
            MessageType::ChatNew
            | MessageType::ChatUpdate
            | MessageType::ChatDelete
            | MessageType::ChatSendMessage
            | MessageType::ChatGetChats
            | MessageType::ChatUpdateRead
            | MessageType::ChatMute => {
                let user = user.ok_or_else(FrameError::unauthenticated)?;
                match frame.message_type {
                    MessageType::ChatNew => self.new_chat(frame, &user).await,
                    MessageType::ChatUpdate => self.update_chat(frame, &user).await,
                    MessageType::ChatDelete => self.delete_chat(frame, &user).await,
                    MessageType::ChatSendMessage => self.send_message(frame, &user).await,
                    MessageType::ChatGetChats => self.get_chats(frame, &user).await,
                    MessageType::ChatUpdateRead => self.update_read(frame, &user).await,
                    _ => self.mute(frame, &user).await,
                }
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        let released = state.subs.len();
        state.subs.clear();
        state.chats.clear();
        drop(state);
        self.user_streams.lock().await.clear();
        debug!(released, "chat plugin closed");
    }
}

impl ChatPlugin {
    fn out(&self) -> &Outbound {
        &self.shared.outbound
    }

    /// Subscribe after the reply has gone out. Failure leaves the client
    /// without live updates for that chat, which it is told about once.
    async fn follow(&self, chat: Chat) {
        let chat_id = chat.id;
        if let Err(err) = self.shared.subscribe_chat(chat).await {
            warn!(chat_id, error = %err, "failed to subscribe to chat");
            self.out()
                .error("", FrameError::server(format!("live updates unavailable for chat {chat_id}")))
                .await;
        }
    }

    async fn send_message(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: SendMessageParams = parse_payload(frame)?;
        let chat_id = parse_id(&params.chat_id, "chat_id")?;

        let mut message = self
            .chats
            .send_message(
                user,
                NewMessageRequest {
                    chat_id,
                    body: params.body,
                    message_type: params.message_type,
                },
            )
            .await?;
        message.author_renown = user.tier;

        self.out().reply(frame, &message).await;
        self.publisher
            .publish(&subjects::chat_messages(chat_id), &NewMessage { message })
            .await;
        Ok(())
    }

    async fn new_chat(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: NewChatParams = parse_payload(frame)?;
        let chat_type =
            ChatType::try_from(params.chat_type).map_err(|_| FrameError::field("chat_type", "range"))?;
        let users = parse_ids(&params.users, "users")?;

        let created = self
            .chats
            .create_chat(
                user,
                NewChatRequest {
                    name: params.name,
                    chat_type,
                    users,
                },
            )
            .await?;
        let chat = created.chat;

        self.out().reply(frame, &chat).await;
        self.follow(chat.clone()).await;

        let others: Vec<i64> = chat.users.iter().copied().filter(|id| *id != user.id).collect();
        let record = NewChat { chat: chat.clone() };
        for member in &others {
            self.publisher.publish(&subjects::new_chat(*member), &record).await;
        }
        if let Some(update) = created.update {
            for member in &others {
                self.publisher.publish(&subjects::chat_updated(*member), &update).await;
            }
        }
        Ok(())
    }

    async fn update_chat(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: EditChatParams = parse_payload(frame)?;
        let request = EditChatRequest {
            chat_id: parse_id(&params.chat_id, "chat_id")?,
            name: Some(params.name).filter(|name| !name.is_empty()),
            add_users: parse_ids(&params.add_users, "add_users")?,
            remove_users: parse_ids(&params.remove_users, "remove_users")?,
        };

        let change = self.chats.update_chat(user, request).await?;
        let chat = &change.chat;
        self.out().reply(frame, chat).await;

        let kick = ChatKick { chat_id: chat.id };
        for removed in &change.update.removed_users {
            self.publisher.publish(&subjects::chat_kick(*removed), &kick).await;
        }
        let record = NewChat { chat: chat.clone() };
        for added in &change.update.added_users {
            self.publisher.publish(&subjects::new_chat(*added), &record).await;
        }
        for member in chat.users.iter().chain(&change.update.removed_users) {
            self.publisher
                .publish(&subjects::chat_updated(*member), &change.update)
                .await;
        }
        Ok(())
    }

    async fn delete_chat(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: ChatIdParams = parse_payload(frame)?;
        let chat_id = parse_id(&params.chat_id, "chat_id")?;

        let change = self.chats.delete_chat(user, chat_id).await?;
        self.out().reply(frame, ChatIdReply { chat_id }).await;
        self.shared.unsubscribe_chat(chat_id).await;

        let kick = ChatKick { chat_id };
        for member in change.chat.users.iter().filter(|id| **id != user.id) {
            self.publisher.publish(&subjects::chat_kick(*member), &kick).await;
        }
        for member in &change.chat.users {
            self.publisher
                .publish(&subjects::chat_updated(*member), &change.update)
                .await;
        }
        Ok(())
    }

    async fn get_chats(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: GetChatsParams = parse_payload(frame)?;
        let chats = self
            .chats
            .chats_for_user(user.id, params.offset, params.limit)
            .await?;
        self.out().reply(frame, ChatsReply { chats }).await;
        Ok(())
    }

    async fn get_messages(&self, frame: &Envelope, user: Option<&User>) -> Result<(), FrameError> {
        let params: GetMessagesParams = parse_payload(frame)?;
        let query = MessageQuery {
            chat_id: parse_id(&params.chat_id, "chat_id")?,
            before: params.timestamp.unwrap_or_else(Utc::now),
            descending: params.descending,
            limit: params.limit,
        };
        let messages = self.chats.get_messages(user, query).await?;
        self.out().reply(frame, MessagesReply { messages }).await;
        Ok(())
    }

    async fn subscribe(&self, frame: &Envelope) -> Result<(), FrameError> {
        let params: SubscribeParams = parse_payload(frame)?;
        if params.chat_type != ChatType::Challenge as u8 {
            return Err(FrameError::bad_request("invalid chat type"));
        }
        let chat_id = parse_id(&params.chat_id, "chat_id")?;

        let cached = self.shared.state.lock().await.chats.get(&chat_id).cloned();
        if let Some(chat) = cached {
            self.out().reply(frame, ChatReply { chat: &chat }).await;
            return Ok(());
        }

        let chat = self
            .chats
            .challenge_chat(chat_id)
            .await?
            .ok_or_else(|| FrameError::bad_request("invalid chat"))?;

        self.shared.subscribe_chat(chat.clone()).await.map_err(|err| {
            warn!(chat_id, error = %err, "failed to subscribe to challenge chat");
            FrameError::server("failed to subscribe to chat")
        })?;
        self.out().reply(frame, ChatReply { chat: &chat }).await;
        Ok(())
    }

    async fn unsubscribe(&self, frame: &Envelope) -> Result<(), FrameError> {
        let params: ChatIdParams = parse_payload(frame)?;
        let chat_id = parse_id(&params.chat_id, "chat_id")?;

        let mut state = self.shared.state.lock().await;
        let chat_type = state
            .chats
            .get(&chat_id)
            .map(|chat| chat.chat_type)
            .ok_or_else(|| FrameError::bad_request("chat is not subscribed"))?;
        if chat_type != ChatType::Challenge {
            return Err(FrameError::bad_request("invalid chat type"));
        }
        state.remove(chat_id);
        drop(state);

        self.out().reply(frame, ChatIdReply { chat_id }).await;
        Ok(())
    }

    async fn update_read(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: UpdateReadParams = parse_payload(frame)?;
        let chat_id = parse_id(&params.chat_id, "chat_id")?;
        let message_id = parse_id(&params.message_id, "message_id")?;
        self.chats.update_read(user.id, chat_id, message_id).await?;
        self.out().reply(frame, MessageIdReply { message_id }).await;
        Ok(())
    }

    async fn mute(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: MuteParams = parse_payload(frame)?;
        let chat_id = parse_id(&params.chat_id, "chat_id")?;
        self.chats.set_mute(user.id, chat_id, params.mute).await?;
        self.out().reply(frame, ChatIdReply { chat_id }).await;
        Ok(())
    }
}
