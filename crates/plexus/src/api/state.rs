//! Application state shared across handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent_bridge::{AgentBridgeFactory, UpstreamSettings};
use crate::auth::SessionAuthenticator;
use crate::bus::{EventBus, EventPublisher};
use crate::chat::ChatPluginFactory;
use crate::config::AppConfig;
use crate::store::{ChatStore, SqliteStore, UserStore, WebUsageStore, WorkspaceClient, WorkspaceStore};
use crate::tracking::TrackingPluginFactory;
use crate::workspace::{WorkspacePluginFactory, WorkspaceSettings};
use crate::ws::PluginFactory;

/// The stores and the bus every plugin is built from.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserStore>,
    pub chats: Arc<dyn ChatStore>,
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub usage: Arc<dyn WebUsageStore>,
    pub workspace_client: Arc<dyn WorkspaceClient>,
    pub publisher: EventPublisher,
}

impl Services {
    /// Back every store with one SQLite database.
    pub fn from_sqlite(store: SqliteStore, workspace_client: Arc<dyn WorkspaceClient>, bus: Arc<dyn EventBus>) -> Self {
        let store = Arc::new(store);
        Self {
            users: store.clone(),
            chats: store.clone(),
            workspaces: store.clone(),
            usage: store,
            workspace_client,
            publisher: EventPublisher::new(bus),
        }
    }
}

/// Chat, workspace, tracking and agent bridge, in that order.
pub fn default_plugins(config: &AppConfig, services: &Services) -> Vec<Arc<dyn PluginFactory>> {
    let chat: Arc<dyn PluginFactory> = Arc::new(ChatPluginFactory::new(
        services.chats.clone(),
        services.publisher.clone(),
        config.chat.initial_chat_limit,
    ));
    let workspace: Arc<dyn PluginFactory> = Arc::new(WorkspacePluginFactory::new(
        services.workspaces.clone(),
        services.workspace_client.clone(),
        services.publisher.bus().clone(),
        WorkspaceSettings::from(&config.workspace),
    ));
    let tracking: Arc<dyn PluginFactory> = Arc::new(TrackingPluginFactory::new(services.usage.clone()));
    let agent_bridge: Arc<dyn PluginFactory> = Arc::new(AgentBridgeFactory::new(
        services.workspaces.clone(),
        UpstreamSettings::from(&config.agent),
    ));
    vec![chat, workspace, tracking, agent_bridge]
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: SessionAuthenticator,
    pub services: Services,
    /// Instantiated once per connection, in order.
    pub plugins: Arc<[Arc<dyn PluginFactory>]>,
    /// Parent of every connection's cancellation scope.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Self {
        let auth = SessionAuthenticator::new(config.auth.clone(), services.users.clone());
        let plugins = default_plugins(&config, &services).into();
        Self {
            config: Arc::new(config),
            auth,
            services,
            plugins,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the plugin set, e.g. to run a subset in tests.
    pub fn with_plugin_factories(mut self, factories: Vec<Arc<dyn PluginFactory>>) -> Self {
        self.plugins = factories.into();
        self
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|factory| factory.name()).collect()
    }
}
