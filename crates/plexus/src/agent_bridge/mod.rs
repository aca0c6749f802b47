//! Agent bridge plugin.
//!
//! Proxies `agent:*` requests to the agent running inside a workspace. One
//! upstream socket is kept per workspace the connection talks to; it is
//! dialed on the first request and dropped after a quiet spell. Sequence ids
//! pass through untouched so responses correlate with the client request.

mod plugin;
mod upstream;

pub use plugin::{AgentBridgeFactory, AgentBridgePlugin};
pub use upstream::{AgentSocket, Upstream, UpstreamSettings, dial};
