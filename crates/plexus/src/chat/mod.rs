//! Chat plugin.
//!
//! Keeps one bus subscription per chat the connection can see: the user's
//! most recent chats, the Global chat, and any challenge chat the client asks
//! for. Authenticated connections also follow their user-scoped streams for
//! new chats, kicks and membership updates.

mod params;
mod plugin;

pub use plugin::{ChatPlugin, ChatPluginFactory};
