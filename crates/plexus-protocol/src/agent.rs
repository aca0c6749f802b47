//! The workspace agent envelope and its translation to and from client frames.
//!
//! Agents speak a flat integer type table. The gateway rewrites
//! `agent:*` client frames into agent envelopes and back, keeping the
//! sequence id untouched in both directions.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::types::MessageType;

/// Agent frame type. Codes are shared with the agent and must not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentMessageType {
    Init,
    ValidationError,
    GenericError,
    ExecRequest,
    ExecResponse,
    LintRequest,
    LintResponse,
    CancelExecRequest,
    CancelExecResponse,
    StdinExecRequest,
    StdinExecResponse,
    LaunchLspRequest,
    LaunchLspResponse,
    /// A code this build does not know.
    Unknown(i64),
}

impl AgentMessageType {
    pub fn code(self) -> i64 {
        match self {
            AgentMessageType::Init => 0,
            AgentMessageType::ValidationError => 1,
            AgentMessageType::GenericError => 2,
            AgentMessageType::ExecRequest => 3,
            AgentMessageType::ExecResponse => 4,
            AgentMessageType::LintRequest => 5,
            AgentMessageType::LintResponse => 6,
            AgentMessageType::CancelExecRequest => 7,
            AgentMessageType::CancelExecResponse => 8,
            AgentMessageType::StdinExecRequest => 9,
            AgentMessageType::StdinExecResponse => 10,
            AgentMessageType::LaunchLspRequest => 11,
            AgentMessageType::LaunchLspResponse => 12,
            AgentMessageType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => AgentMessageType::Init,
            1 => AgentMessageType::ValidationError,
            2 => AgentMessageType::GenericError,
            3 => AgentMessageType::ExecRequest,
            4 => AgentMessageType::ExecResponse,
            5 => AgentMessageType::LintRequest,
            6 => AgentMessageType::LintResponse,
            7 => AgentMessageType::CancelExecRequest,
            8 => AgentMessageType::CancelExecResponse,
            9 => AgentMessageType::StdinExecRequest,
            10 => AgentMessageType::StdinExecResponse,
            11 => AgentMessageType::LaunchLspRequest,
            12 => AgentMessageType::LaunchLspResponse,
            other => AgentMessageType::Unknown(other),
        }
    }
}

impl Serialize for AgentMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for AgentMessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(AgentMessageType::from_code(i64::deserialize(deserializer)?))
    }
}

/// Who produced an agent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Origin {
    Server = 0,
    Client = 1,
}

impl From<Origin> for u8 {
    fn from(value: Origin) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Origin {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::Server),
            1 => Ok(Origin::Client),
            other => Err(format!("unknown origin {other}")),
        }
    }
}

/// A frame on the gateway to agent socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvelope {
    #[serde(default)]
    pub sequence_id: String,
    #[serde(rename = "type")]
    pub message_type: AgentMessageType,
    pub origin: Origin,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported message type: {0}")]
pub struct UnsupportedType(pub String);

/// Map a client request type onto the agent table.
pub fn agent_type_for(message_type: &MessageType) -> Option<AgentMessageType> {
    Some(match message_type {
        MessageType::AgentExecRequest => AgentMessageType::ExecRequest,
        MessageType::AgentLintRequest => AgentMessageType::LintRequest,
        MessageType::AgentCancelExec => AgentMessageType::CancelExecRequest,
        MessageType::AgentStdin => AgentMessageType::StdinExecRequest,
        MessageType::AgentLaunchLsp => AgentMessageType::LaunchLspRequest,
        _ => return None,
    })
}

/// Map an agent type back onto the client namespace. `Init` has no client form.
pub fn client_type_for(message_type: AgentMessageType) -> Option<MessageType> {
    Some(match message_type {
        AgentMessageType::ExecResponse => MessageType::AgentExecResponse,
        AgentMessageType::LintResponse => MessageType::AgentLintResponse,
        AgentMessageType::CancelExecRequest => MessageType::AgentCancelExec,
        AgentMessageType::CancelExecResponse => MessageType::AgentCancelExecResponse,
        AgentMessageType::StdinExecRequest => MessageType::AgentStdin,
        AgentMessageType::StdinExecResponse => MessageType::AgentStdinResponse,
        AgentMessageType::LaunchLspResponse => MessageType::AgentLaunchLspResponse,
        AgentMessageType::GenericError => MessageType::ErrorGeneric,
        AgentMessageType::ValidationError => MessageType::ErrorValidation,
        _ => return None,
    })
}

/// Wrap a client frame's inner payload for the agent.
pub fn to_agent(frame: &Envelope, inner: Value, created_at: i64) -> Result<AgentEnvelope, UnsupportedType> {
    let message_type = agent_type_for(&frame.message_type)
        .ok_or_else(|| UnsupportedType(frame.message_type.to_string()))?;
    Ok(AgentEnvelope {
        sequence_id: frame.sequence_id.clone(),
        message_type,
        origin: Origin::Client,
        created_at,
        payload: inner,
    })
}

/// Outcome of translating one agent frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FromAgent {
    /// Forward this frame to the client.
    Frame(Envelope),
    /// Nothing to forward (`init`, or a frame with no sequence id to route by).
    Absorbed,
    /// The agent sent a type with no client form.
    Unsupported {
        sequence_id: String,
        error: UnsupportedType,
    },
}

pub fn from_agent(envelope: AgentEnvelope) -> FromAgent {
    if envelope.message_type == AgentMessageType::Init {
        return FromAgent::Absorbed;
    }
    let Some(message_type) = client_type_for(envelope.message_type) else {
        return FromAgent::Unsupported {
            error: UnsupportedType(envelope.message_type.code().to_string()),
            sequence_id: envelope.sequence_id,
        };
    };
    if envelope.sequence_id.is_empty() {
        return FromAgent::Absorbed;
    }
    FromAgent::Frame(Envelope {
        sequence_id: envelope.sequence_id,
        message_type,
        payload: envelope.payload,
    })
}
