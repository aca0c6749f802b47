//! The per-connection WebSocket layer.
//!
//! [`handler`] upgrades the request and authenticates it, [`Hub`] owns the
//! socket for its lifetime, and [`Plugin`]s do the domain work.

mod connection;
mod error;
pub mod handler;
mod hub;
mod plugin;
mod poller;

pub use connection::{Activity, Connection, SessionUser};
pub use error::{FrameError, decimal_id, decimal_ids, parse_id, parse_ids, parse_payload};
pub use hub::{Hub, HubSettings};
pub use plugin::{Outbound, Plugin, PluginContext, PluginFactory};
pub use poller::{poll_interval, run_user_poller};
