//! Wire, bus and agent types for the Plexus realtime gateway.
//!
//! This crate has no I/O. It defines every shape that crosses a boundary:
//!
//! ```text
//! Browser <--[WS: JSON Envelope]--> Gateway <--[Bus: CBOR records]--> other Gateway nodes
//!                                      |
//!                                      +--[WS: JSON AgentEnvelope]--> Workspace agent
//! ```
//!
//! ## Layout
//!
//! - [`envelope`]: the client frame and its codec.
//! - [`types`]: the shared `namespace:action` message type namespace.
//! - [`error`]: error payloads carried by `error:*` frames.
//! - [`models`]: users, chats, messages and workspaces as seen on the wire.
//! - [`bus`]: bus subjects, bus records and the structured-binary codec.
//! - [`agent`]: the agent envelope and its translation to and from client frames.

pub mod agent;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod models;
pub mod types;

pub use envelope::{CodecError, Envelope};
pub use error::{ErrorCode, ErrorPayload};
pub use types::MessageType;
