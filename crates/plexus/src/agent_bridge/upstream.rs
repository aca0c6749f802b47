//! One gateway to agent socket.
//!
//! The socket is owned by a single task that writes requests queued by the
//! plugin, reads agent frames, and closes the socket once nothing has moved
//! for the idle timeout and no request is waiting on an answer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use dashmap::DashSet;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use plexus_protocol::agent::{AgentEnvelope, FromAgent, from_agent};
use plexus_protocol::{Envelope, MessageType};

use crate::config::AgentConfig;
use crate::store::AgentEndpoint;
use crate::ws::{FrameError, Outbound};

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub ws_path: String,
}

impl From<&AgentConfig> for UpstreamSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            ws_path: config.ws_path.clone(),
        }
    }
}

/// Open the agent socket, authenticating with the agent secret.
pub async fn dial(endpoint: &AgentEndpoint, settings: &UpstreamSettings) -> anyhow::Result<AgentSocket> {
    let url = format!("{}{}", endpoint.url.trim_end_matches('/'), settings.ws_path);
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid agent url {url}"))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", endpoint.secret)).context("invalid agent secret")?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    match timeout(settings.connect_timeout, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(err)) => Err(err).with_context(|| format!("failed to dial agent at {url}")),
        Err(_) => bail!("timed out dialing agent at {url}"),
    }
}

/// Whether a response settles the request with the same sequence id.
/// Exec and stdin stream partial output until `done`.
fn settles(frame: &Envelope) -> bool {
    match frame.message_type {
        MessageType::AgentExecResponse | MessageType::AgentStdinResponse => {
            frame.payload.get("done").and_then(|done| done.as_bool()) == Some(true)
        }
        // Requests the agent makes of the client.
        MessageType::AgentCancelExec | MessageType::AgentStdin => false,
        _ => true,
    }
}

/// Why the upstream task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Idle,
    Cancelled,
    Lost,
}

/// Handle to a live upstream. Dropping it leaves the task running until it
/// is cancelled or the socket closes.
pub struct Upstream {
    workspace_id: i64,
    tx: mpsc::Sender<AgentEnvelope>,
    in_flight: Arc<DashSet<String>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Upstream {
    pub fn spawn<S>(
        workspace_id: i64,
        socket: S,
        outbound: Outbound,
        idle_timeout: Duration,
        parent: &CancellationToken,
    ) -> Self
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error>,
        S: Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let in_flight = Arc::new(DashSet::new());
        let cancel = parent.child_token();

        let relay = Relay {
            workspace_id,
            outbound,
            in_flight: in_flight.clone(),
            cancel: cancel.clone(),
            idle_timeout,
        };
        let task = tokio::spawn(relay.run(socket, rx).instrument(Span::current()));

        Self {
            workspace_id,
            tx,
            in_flight,
            cancel,
            task,
        }
    }

    pub fn workspace_id(&self) -> i64 {
        self.workspace_id
    }

    /// The socket is gone; the next request needs a fresh dial.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue a request. Its sequence id stays in flight until answered.
    pub async fn send(&self, envelope: AgentEnvelope) -> Result<(), FrameError> {
        let sequence_id = envelope.sequence_id.clone();
        if !sequence_id.is_empty() {
            self.in_flight.insert(sequence_id.clone());
        }
        if self.tx.send(envelope).await.is_err() {
            self.in_flight.remove(&sequence_id);
            return Err(FrameError::server("agent connection closed"));
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(workspace_id = self.workspace_id, error = %err, "agent relay ended abnormally");
        }
    }
}

struct Relay {
    workspace_id: i64,
    outbound: Outbound,
    in_flight: Arc<DashSet<String>>,
    cancel: CancellationToken,
    idle_timeout: Duration,
}

impl Relay {
    async fn run<S>(self, socket: S, mut rx: mpsc::Receiver<AgentEnvelope>)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Sink<Message, Error = tungstenite::Error>,
        S: Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let mut last_activity = Instant::now();
        info!(workspace_id = self.workspace_id, "agent upstream connected");

        let exit = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Cancelled,

                request = rx.recv() => {
                    let Some(request) = request else { break Exit::Cancelled };
                    last_activity = Instant::now();
                    let text = match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(err) => {
                            self.fail(&request.sequence_id, format!("failed to encode agent request: {err}")).await;
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        warn!(workspace_id = self.workspace_id, error = %err, "agent write failed");
                        break Exit::Lost;
                    }
                }

                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        self.relay(text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break Exit::Lost,
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(err)) => {
                        warn!(workspace_id = self.workspace_id, error = %err, "agent read failed");
                        break Exit::Lost;
                    }
                },

                _ = sleep_until(last_activity + self.idle_timeout) => {
                    if self.in_flight.is_empty() {
                        break Exit::Idle;
                    }
                    last_activity = Instant::now();
                }
            }
        };

        self.cancel.cancel();
        rx.close();
        if exit != Exit::Lost {
            let _ = sink.send(Message::Close(None)).await;
        }

        let orphaned: Vec<String> = self.in_flight.iter().map(|seq| seq.key().clone()).collect();
        self.in_flight.clear();
        if exit == Exit::Lost {
            for sequence_id in &orphaned {
                self.outbound
                    .error(sequence_id, FrameError::server("agent connection closed"))
                    .await;
            }
        }
        debug!(
            workspace_id = self.workspace_id,
            ?exit,
            orphaned = orphaned.len(),
            "agent upstream closed"
        );
    }

    async fn relay(&self, text: &str) {
        let envelope: AgentEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(workspace_id = self.workspace_id, error = %err, "undecodable agent frame");
                return;
            }
        };

        match from_agent(envelope) {
            FromAgent::Frame(frame) => {
                if settles(&frame) {
                    self.in_flight.remove(&frame.sequence_id);
                }
                self.outbound.send(frame).await;
            }
            FromAgent::Absorbed => {}
            FromAgent::Unsupported { sequence_id, error } => self.fail(&sequence_id, error.to_string()).await,
        }
    }

    async fn fail(&self, sequence_id: &str, message: String) {
        warn!(workspace_id = self.workspace_id, sequence_id, %message, "agent exchange failed");
        self.in_flight.remove(sequence_id);
        if !sequence_id.is_empty() {
            self.outbound.error(sequence_id, FrameError::server(message)).await;
        }
    }
}
