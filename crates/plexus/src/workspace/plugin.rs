use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, warn};
use validator::Validate;

use plexus_protocol::bus::{WorkspaceStatusUpdate, subjects};
use plexus_protocol::models::{InitState, User, Workspace, WorkspaceState};
use plexus_protocol::{Envelope, MessageType};

use crate::bus::{self, BusResult, Delivery, EventBus, Handler, SubscribeOptions, Subscription};
use crate::config::WorkspaceConfig;
use crate::store::{WorkspaceClient, WorkspaceStore};
use crate::ws::{
    Connection, FrameError, Outbound, Plugin, PluginContext, PluginFactory, decimal_id, parse_id, parse_payload,
};

// ============================================================================
// Settings and params
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    /// Cadence of the running-agent check while a completion is held back.
    pub stall_poll: Duration,
    /// Longest a completion is held back.
    pub stall_timeout: Duration,
    pub sample_interval: Duration,
    pub sample_timeout: Duration,
}

impl From<&WorkspaceConfig> for WorkspaceSettings {
    fn from(config: &WorkspaceConfig) -> Self {
        Self {
            stall_poll: config.stall_poll(),
            stall_timeout: config.stall_timeout(),
            sample_interval: config.sample_interval(),
            sample_timeout: config.sample_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
struct WorkspaceIdParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    workspace_id: String,
}

// ============================================================================
// Factory
// ============================================================================

pub struct WorkspacePluginFactory {
    workspaces: Arc<dyn WorkspaceStore>,
    client: Arc<dyn WorkspaceClient>,
    bus: Arc<dyn EventBus>,
    settings: WorkspaceSettings,
}

impl WorkspacePluginFactory {
    pub fn new(
        workspaces: Arc<dyn WorkspaceStore>,
        client: Arc<dyn WorkspaceClient>,
        bus: Arc<dyn EventBus>,
        settings: WorkspaceSettings,
    ) -> Self {
        Self {
            workspaces,
            client,
            bus,
            settings,
        }
    }
}

#[async_trait]
impl PluginFactory for WorkspacePluginFactory {
    fn name(&self) -> &'static str {
        "workspace"
    }

    async fn create(&self, ctx: PluginContext) -> anyhow::Result<Arc<dyn Plugin>> {
        let cancel = ctx.conn.cancel_token().child_token();
        let anonymous = ctx.conn.user().is_anonymous();

        let shared = Arc::new(Shared {
            conn: ctx.conn,
            outbound: ctx.outbound,
            bus: self.bus.clone(),
            workspaces: self.workspaces.clone(),
            settings: self.settings.clone(),
            cancel,
            state: Mutex::new(Watched::default()),
        });

        // Sampling is per user; anonymous connections cannot subscribe anyway.
        let sampler = (!anonymous).then(|| {
            tokio::spawn(run_sampler(shared.clone(), self.client.clone()).instrument(Span::current()))
        });

        Ok(Arc::new(WorkspacePlugin {
            shared,
            sampler: Mutex::new(sampler),
        }))
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Default)]
struct Watched {
    subs: HashMap<i64, Watch>,
    last: HashMap<i64, Workspace>,
}

/// A live status subscription. Dropping it also cancels any completion
/// still held back for the workspace.
struct Watch {
    _sub: Subscription,
    cancel: CancellationToken,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Shared {
    conn: Connection,
    outbound: Outbound,
    bus: Arc<dyn EventBus>,
    workspaces: Arc<dyn WorkspaceStore>,
    settings: WorkspaceSettings,
    cancel: CancellationToken,
    state: Mutex<Watched>,
}

/// How a held-back completion was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    AgentRunning,
    TimedOut,
    Cancelled,
}

impl Shared {
    /// Subscribe to a workspace's status stream and record its current
    /// state. Nothing is recorded if the bus refuses the subscription.
    async fn watch(self: &Arc<Self>, workspace: Workspace) -> BusResult<()> {
        let workspace_id = workspace.id;
        let mut state = self.state.lock().await;
        if !state.subs.contains_key(&workspace_id) {
            let cancel = self.cancel.child_token();
            let sub = self
                .bus
                .subscribe(
                    &subjects::workspace_status(workspace_id),
                    SubscribeOptions::default(),
                    status_handler(Arc::downgrade(self), cancel.clone()),
                )
                .await?;
            state.subs.insert(workspace_id, Watch { _sub: sub, cancel });
        }
        state.last.insert(workspace_id, workspace);
        Ok(())
    }

    /// Whether a status change has to wait for the agent before it is shown.
    async fn must_stall(&self, update: &Workspace) -> bool {
        if update.init_state != InitState::Completed {
            return false;
        }
        let state = self.state.lock().await;
        state
            .last
            .get(&update.id)
            .is_some_and(|last| last.init_state != InitState::Completed)
    }

    async fn await_agent(&self, workspace_id: i64, cancel: &CancellationToken) -> Stall {
        let poll = async {
            loop {
                match self.workspaces.running_agent(workspace_id).await {
                    Ok(Some(agent_id)) => {
                        debug!(workspace_id, agent_id, "agent is running");
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => warn!(workspace_id, error = %err, "running agent lookup failed"),
                }
                sleep(self.settings.stall_poll).await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Stall::Cancelled,
            result = timeout(self.settings.stall_timeout, poll) => match result {
                Ok(()) => Stall::AgentRunning,
                Err(_) => {
                    error!(
                        workspace_id,
                        waited_ms = self.settings.stall_timeout.as_millis() as u64,
                        "no running agent for completed workspace, forwarding anyway"
                    );
                    Stall::TimedOut
                }
            },
        }
    }
}

fn status_handler(shared: Weak<Shared>, cancel: CancellationToken) -> Handler {
    let span = Span::current();
    bus::handler(move |delivery: Delivery| {
        // Acked before the stall, which can outlast the ack wait.
        delivery.ack();
        let shared = shared.upgrade();
        let cancel = cancel.clone();
        async move {
            let Some(shared) = shared else { return };
            let update: WorkspaceStatusUpdate = match delivery.decode() {
                Ok(update) => update,
                Err(err) => {
                    warn!(subject = delivery.subject(), error = %err, "failed to decode workspace status");
                    return;
                }
            };
            let workspace_id = update.workspace.id;

            if shared.must_stall(&update.workspace).await
                && shared.await_agent(workspace_id, &cancel).await == Stall::Cancelled
            {
                debug!(workspace_id, "held back status dropped after unsubscribe");
                return;
            }

            {
                let mut state = shared.state.lock().await;
                if cancel.is_cancelled() || !state.subs.contains_key(&workspace_id) {
                    return;
                }
                state.last.insert(workspace_id, update.workspace.clone());
            }

            shared
                .outbound
                .push(MessageType::WorkspaceStatusUpdate, &update)
                .await;
        }
        .instrument(span.clone())
    })
}

/// Push utilization for every subscribed, active workspace each tick.
async fn run_sampler(shared: Arc<Shared>, client: Arc<dyn WorkspaceClient>) {
    let every = shared.settings.sample_interval;
    let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(user_id) = shared.conn.user().id() else {
            continue;
        };

        let active: Vec<Workspace> = {
            let state = shared.state.lock().await;
            state
                .subs
                .keys()
                .filter_map(|id| state.last.get(id))
                .filter(|ws| ws.state == WorkspaceState::Active)
                .cloned()
                .collect()
        };

        for workspace in active {
            let sample = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                sample = timeout(shared.settings.sample_timeout, client.get_resource_util(workspace.id, user_id)) => sample,
            };
            match sample {
                Ok(Ok(resources)) => {
                    shared
                        .outbound
                        .push(
                            MessageType::WorkspaceStatusUpdate,
                            WorkspaceStatusUpdate {
                                workspace,
                                resources: Some(resources),
                            },
                        )
                        .await;
                }
                Ok(Err(err)) => {
                    warn!(workspace_id = workspace.id, error = %err, "resource utilization lookup failed");
                }
                Err(_) => warn!(workspace_id = workspace.id, "resource utilization lookup timed out"),
            }
        }
    }
    debug!("workspace sampler stopped");
}

// ============================================================================
// Plugin
// ============================================================================

pub struct WorkspacePlugin {
    shared: Arc<Shared>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Plugin for WorkspacePlugin {
    fn name(&self) -> &'static str {
        "workspace"
    }

    async fn handle(&self, frame: &Envelope) -> Result<(), FrameError> {
        match frame.message_type {
            MessageType::WorkspaceSubscribe | MessageType::WorkspaceUnsubscribe => {
                let user = self
                    .shared
                    .conn
                    .user()
                    .load()
                    .ok_or_else(FrameError::unauthenticated)?;
                if frame.message_type == MessageType::WorkspaceSubscribe {
                    self.subscribe(frame, &user).await
                } else {
                    self.unsubscribe(frame).await
                }
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        self.shared.cancel.cancel();
        let sampler = self.sampler.lock().await.take();
        if let Some(sampler) = sampler {
            if let Err(err) = sampler.await {
                warn!(error = %err, "workspace sampler ended abnormally");
            }
        }
        let mut state = self.shared.state.lock().await;
        let released = state.subs.len();
        state.subs.clear();
        state.last.clear();
        debug!(released, "workspace plugin closed");
    }
}

impl WorkspacePlugin {
    async fn subscribe(&self, frame: &Envelope, user: &User) -> Result<(), FrameError> {
        let params: WorkspaceIdParams = parse_payload(frame)?;
        let workspace_id = parse_id(&params.workspace_id, "workspace_id")?;

        let workspace = self
            .shared
            .workspaces
            .workspace_status(user.id, workspace_id)
            .await?
            .ok_or_else(|| FrameError::bad_request("workspace not found"))?;

        if let Err(err) = self.shared.watch(workspace.clone()).await {
            warn!(workspace_id, error = %err, "failed to subscribe to workspace status");
            return Err(FrameError::server("failed to subscribe to workspace status"));
        }

        self.shared
            .outbound
            .reply_as(
                frame,
                MessageType::WorkspaceStatusUpdate,
                WorkspaceStatusUpdate {
                    workspace,
                    resources: None,
                },
            )
            .await;
        Ok(())
    }

    async fn unsubscribe(&self, frame: &Envelope) -> Result<(), FrameError> {
        let params: WorkspaceIdParams = parse_payload(frame)?;
        let workspace_id = parse_id(&params.workspace_id, "workspace_id")?;

        let mut state = self.shared.state.lock().await;
        state.subs.remove(&workspace_id);
        state.last.remove(&workspace_id);
        Ok(())
    }
}
