//! Runtime configuration.
//!
//! Every section is `#[serde(default)]` so a partial TOML file, or none at
//! all, yields a working gateway. Durations are stored in milliseconds.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub user_poll: UserPollConfig,
    pub chat: ChatConfig,
    pub workspace: WorkspaceConfig,
    pub agent: AgentConfig,
    pub bus: BusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            gateway: GatewayConfig::default(),
            user_poll: UserPollConfig::default(),
            chat: ChatConfig::default(),
            workspace: WorkspaceConfig::default(),
            agent: AgentConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reverse proxies whose `X-Forwarded-For` header is believed. Empty
    /// means the TCP peer address is always used.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data_dir>/plexus.db`.
    pub path: Option<String>,
}

/// Per-connection transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub ping_interval_ms: u64,
    pub max_missed_pongs: u32,
    pub write_timeout_ms: u64,
    /// Inbound frames above this size are rejected by the transport.
    pub max_message_size: usize,
    /// Capacity of each plugin's outbound channel.
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            max_missed_pongs: 3,
            write_timeout_ms: 10_000,
            max_message_size: 1 << 18,
            outbound_buffer: 64,
        }
    }
}

impl GatewayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Cadence of the per-connection user refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPollConfig {
    pub hot_ms: u64,
    pub warm_ms: u64,
    pub cold_ms: u64,
    /// Idle below this is hot.
    pub hot_below_ms: u64,
    /// Idle below this is warm.
    pub warm_below_ms: u64,
    /// Idle at or above this is cold.
    pub cold_after_ms: u64,
}

impl Default for UserPollConfig {
    fn default() -> Self {
        Self {
            hot_ms: 30_000,
            warm_ms: 180_000,
            cold_ms: 900_000,
            hot_below_ms: 60_000,
            warm_below_ms: 900_000,
            cold_after_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Most-recent chats subscribed on connect.
    pub initial_chat_limit: i64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            initial_chat_limit: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub stall_poll_ms: u64,
    pub stall_timeout_ms: u64,
    pub sample_interval_ms: u64,
    pub sample_timeout_ms: u64,
    /// Base URL of the workspace provisioner's HTTP API.
    pub client_base_url: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            stall_poll_ms: 1_000,
            stall_timeout_ms: 30_000,
            sample_interval_ms: 5_000,
            sample_timeout_ms: 10_000,
            client_base_url: "http://127.0.0.1:9090".to_string(),
        }
    }
}

impl WorkspaceConfig {
    pub fn stall_poll(&self) -> Duration {
        Duration::from_millis(self.stall_poll_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Path appended to the agent base URL when dialing.
    pub ws_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 600_000,
            ws_path: "/api/v1/ws".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Redelivery delay for un-acked messages.
    pub ack_wait_ms: u64,
    pub max_deliver: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ack_wait_ms: 30_000,
            max_deliver: 5,
        }
    }
}

impl BusConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }
}
