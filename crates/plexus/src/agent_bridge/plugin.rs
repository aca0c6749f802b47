use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use validator::Validate;

use plexus_protocol::agent::{agent_type_for, to_agent};
use plexus_protocol::models::{User, WorkspaceState};
use plexus_protocol::{Envelope, MessageType};

use super::upstream::{Upstream, UpstreamSettings, dial};
use crate::store::WorkspaceStore;
use crate::ws::{
    Connection, FrameError, Outbound, Plugin, PluginContext, PluginFactory, decimal_id, parse_id, parse_payload,
};

/// How far a keepalive pushes the workspace expiration, in minutes.
const KEEPALIVE_EXTENSION_MINS: i64 = 10;

#[derive(Debug, Deserialize, Validate)]
struct BridgeParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    workspace_id: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize, Validate)]
struct KeepaliveParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    workspace_id: String,
}

pub struct AgentBridgeFactory {
    workspaces: Arc<dyn WorkspaceStore>,
    settings: UpstreamSettings,
}

impl AgentBridgeFactory {
    pub fn new(workspaces: Arc<dyn WorkspaceStore>, settings: UpstreamSettings) -> Self {
        Self { workspaces, settings }
    }
}

#[async_trait]
impl PluginFactory for AgentBridgeFactory {
    fn name(&self) -> &'static str {
        "agent_bridge"
    }

    async fn create(&self, ctx: PluginContext) -> anyhow::Result<Arc<dyn Plugin>> {
        Ok(Arc::new(AgentBridgePlugin {
            conn: ctx.conn,
            outbound: ctx.outbound,
            workspaces: self.workspaces.clone(),
            settings: self.settings.clone(),
            upstreams: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct AgentBridgePlugin {
    conn: Connection,
    outbound: Outbound,
    workspaces: Arc<dyn WorkspaceStore>,
    settings: UpstreamSettings,
    /// Keyed by workspace id. The user is fixed for the connection.
    upstreams: Mutex<HashMap<i64, Upstream>>,
}

#[async_trait]
impl Plugin for AgentBridgePlugin {
    fn name(&self) -> &'static str {
        "agent_bridge"
    }

    async fn handle(&self, frame: &Envelope) -> Result<(), FrameError> {
        if frame.message_type.namespace() != "agent" {
            return Ok(());
        }
        let user = self.conn.user().load().ok_or_else(FrameError::unauthenticated)?;

        if frame.message_type == MessageType::AgentKeepalive {
            return self.keepalive(frame, &user).await;
        }
        if agent_type_for(&frame.message_type).is_none() {
            return Err(FrameError::bad_request(format!(
                "unsupported message type: {}",
                frame.message_type
            )));
        }
        self.forward(frame, &user).await
    }

    async fn close(&self) {
        let upstreams: Vec<Upstream> = self.upstreams.lock().await.drain().map(|(_, up)| up).collect();
        let released = upstreams.len();
        for upstream in upstreams {
            upstream.shutdown().await;
        }
        debug!(released, "agent bridge closed");
    }
}

impl AgentBridgePlugin {
    async fn forward(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: BridgeParams = parse_payload(frame)?;
        let workspace_id = parse_id(&params.workspace_id, "workspace_id")?;
        let envelope = to_agent(frame, params.payload, Utc::now().timestamp())
            .map_err(|err| FrameError::bad_request(err.to_string()))?;

        let mut upstreams = self.upstreams.lock().await;
        if upstreams.get(&workspace_id).is_none_or(Upstream::is_closed) {
            let upstream = self.connect(user, workspace_id).await?;
            if let Some(stale) = upstreams.insert(workspace_id, upstream) {
                stale.shutdown().await;
            }
        }
        let upstream = upstreams
            .get(&workspace_id)
            .ok_or_else(|| FrameError::server("agent connection closed"))?;
        upstream.send(envelope).await
    }

    async fn connect(&self, user: &User, workspace_id: i64) -> Result<Upstream, FrameError> {
        let endpoint = self
            .workspaces
            .agent_endpoint(user.id, workspace_id)
            .await?
            .ok_or_else(|| FrameError::server("cannot find workspace or workspace agent"))?;
        if endpoint.workspace_state != WorkspaceState::Active {
            return Err(FrameError::server("workspace is not active"));
        }

        let socket = dial(&endpoint, &self.settings).await.map_err(|err| {
            warn!(workspace_id, agent_id = endpoint.agent_id, error = %err, "agent dial failed");
            FrameError::server("failed to connect to workspace agent")
        })?;

        Ok(Upstream::spawn(
            workspace_id,
            socket,
            self.outbound.clone(),
            self.settings.idle_timeout,
            self.conn.cancel_token(),
        ))
    }

    async fn keepalive(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: KeepaliveParams = parse_payload(frame)?;
        let workspace_id = parse_id(&params.workspace_id, "workspace_id")?;
        let until = Utc::now() + chrono::Duration::minutes(KEEPALIVE_EXTENSION_MINS);
        self.workspaces
            .extend_expiration(user.id, workspace_id, until)
            .await?;
        Ok(())
    }
}
