//! The shared message type namespace.
//!
//! Every frame type lives in one flat `namespace:action` namespace so the hub
//! can offer a frame to plugins without consulting a registry. Unknown strings
//! decode to [`MessageType::Unknown`] instead of failing.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! message_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// A frame type tag.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant,)+
            /// A tag this build does not know. Dispatch drops it.
            Unknown(String),
        }

        impl MessageType {
            /// Every known tag, in declaration order.
            pub const KNOWN: &'static [MessageType] = &[$(MessageType::$variant,)+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(MessageType::$variant => $wire,)+
                    MessageType::Unknown(raw) => raw.as_str(),
                }
            }

            pub fn parse(raw: &str) -> Self {
                match raw {
                    $($wire => MessageType::$variant,)+
                    other => MessageType::Unknown(other.to_string()),
                }
            }
        }
    };
}

message_types! {
    // chat
    ChatNew => "chat:new",
    ChatUpdate => "chat:update",
    ChatDelete => "chat:delete",
    ChatSendMessage => "chat:send-message",
    ChatGetChats => "chat:get-chats",
    ChatGetMessages => "chat:get-messages",
    ChatSubscribe => "chat:subscribe",
    ChatUnsubscribe => "chat:unsubscribe",
    ChatUpdateRead => "chat:update-read",
    ChatMute => "chat:mute",
    ChatIncomingMessage => "chat:incoming-message",
    ChatNewBroadcast => "chat:new-broadcast",
    ChatKick => "chat:kick",
    ChatUpdatedEvent => "chat:updated-event",

    // workspace
    WorkspaceSubscribe => "workspace:subscribe",
    WorkspaceUnsubscribe => "workspace:unsubscribe",
    WorkspaceStatusUpdate => "workspace:status-update",

    // tracking
    TrackingRecord => "tracking:record",

    // agent bridge
    AgentExecRequest => "agent:exec-request",
    AgentExecResponse => "agent:exec-response",
    AgentLintRequest => "agent:lint-request",
    AgentLintResponse => "agent:lint-response",
    AgentCancelExec => "agent:cancel-exec",
    AgentCancelExecResponse => "agent:cancel-exec-response",
    AgentStdin => "agent:stdin",
    AgentStdinResponse => "agent:stdin-response",
    AgentLaunchLsp => "agent:launch-lsp",
    AgentLaunchLspResponse => "agent:launch-lsp-response",
    AgentKeepalive => "agent:keepalive",

    // errors
    ErrorGeneric => "error:generic",
    ErrorValidation => "error:validation",
}

impl MessageType {
    /// The part before the colon, e.g. `chat` for `chat:new`.
    pub fn namespace(&self) -> &str {
        let raw = self.as_str();
        raw.split_once(':').map_or(raw, |(ns, _)| ns)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, MessageType::Unknown(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MessageType {
    fn from(raw: &str) -> Self {
        MessageType::parse(raw)
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::parse(&raw))
    }
}
