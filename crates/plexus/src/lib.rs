//! Plexus: a realtime multiplex WebSocket gateway.
//!
//! One socket per browser tab carries chat, workspace status, usage tracking
//! and agent traffic. Each connection is owned by a [`ws::Hub`] that offers
//! every inbound frame to a set of plugins and merges their outbound frames
//! onto the socket. Plugins fan domain events in from the [`bus`].

pub mod agent_bridge;
pub mod api;
pub mod auth;
pub mod bus;
pub mod chat;
pub mod config;
pub mod db;
pub mod store;
pub mod tracking;
pub mod workspace;
pub mod ws;

pub use config::AppConfig;
