//! Test utilities and common setup.
//!
//! Boots the real router on an ephemeral port over an in-memory database and
//! the in-memory bus, and talks to it with a tokio-tungstenite client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};

use plexus::AppConfig;
use plexus::api::{AppState, Services, create_router};
use plexus::auth::Claims;
use plexus::bus::{EventPublisher, InMemoryBus};
use plexus::db::Database;
use plexus::store::{SqliteStore, StoreResult, WorkspaceClient};
use plexus_protocol::agent::AgentEnvelope;
use plexus_protocol::models::{ResourceUtil, User};
use plexus_protocol::{Envelope, MessageType};

pub const SECRET: &str = "plexus-integration-secret-0123456789abcdef";

/// How long a test waits for a frame it expects.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Server
// ============================================================================

/// Resource samples handed out by the scripted provisioner.
pub struct ScriptedClient {
    pub util: std::sync::Mutex<ResourceUtil>,
    pub calls: std::sync::Mutex<Vec<(i64, i64)>>,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self {
            util: std::sync::Mutex::new(ResourceUtil::new(0.5, 2.0, 256.0, 1024.0)),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkspaceClient for ScriptedClient {
    async fn get_resource_util(&self, workspace_id: i64, user_id: i64) -> StoreResult<ResourceUtil> {
        self.calls.lock().unwrap().push((workspace_id, user_id));
        Ok(*self.util.lock().unwrap())
    }
}

/// Timings short enough to exercise stalls and samplers in real time.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some(SECRET.to_string());
    config.workspace.stall_poll_ms = 50;
    config.workspace.stall_timeout_ms = 600;
    config.workspace.sample_interval_ms = 60_000;
    config.workspace.sample_timeout_ms = 500;
    config.agent.connect_timeout_ms = 1_000;
    config.bus.ack_wait_ms = 2_000;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: SqliteStore,
    pub bus: Arc<InMemoryBus>,
    pub publisher: EventPublisher,
    pub client: Arc<ScriptedClient>,
    pub state: AppState,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: AppConfig) -> Self {
        config.auth.validate().expect("test auth config is valid");

        let database = Database::in_memory().await.expect("in-memory database");
        let store = SqliteStore::new(database.pool().clone());
        let bus = Arc::new(InMemoryBus::new(config.bus.ack_wait(), config.bus.max_deliver));
        let client = Arc::new(ScriptedClient::default());

        let services = Services::from_sqlite(store.clone(), client.clone(), bus.clone());
        let publisher = services.publisher.clone();
        let state = AppState::new(config, services);
        let app = create_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = state.shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .expect("test server");
        });

        Self {
            addr,
            store,
            bus,
            publisher,
            client,
            state,
            task,
        }
    }

    /// Wait until `subject` has `count` live subscriptions.
    pub async fn wait_for_subscribers(&self, subject: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while self.bus.subscriber_count(subject) != count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{subject} never reached {count} subscribers"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn seed_user(&self, id: i64, name: &str, tier: i32) -> User {
        let user = User {
            id,
            user_name: name.to_string(),
            tier,
        };
        self.store.upsert_user(&user).await.expect("seed user");
        user
    }

    /// Open `/ws` as the given user.
    pub async fn connect_as(&self, user_id: i64) -> Client {
        Client::connect(&self.url("/ws"), Some(&cookie_for(user_id))).await
    }

    pub async fn connect_anonymous(&self) -> Client {
        Client::connect(&self.url("/ws"), None).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.task.abort();
    }
}

/// A `Cookie` header value carrying a fresh session for `user_id`.
pub fn cookie_for(user_id: i64) -> String {
    let token = Claims::for_user(user_id, chrono::Duration::hours(1))
        .sign(SECRET)
        .expect("sign test token");
    format!("auth_token={token}")
}

// ============================================================================
// Client
// ============================================================================

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Client {
    ws: Socket,
}

impl Client {
    pub async fn connect(url: &str, cookie: Option<&str>) -> Self {
        match Self::try_connect(url, cookie).await {
            Ok(client) => client,
            Err(err) => panic!("connect {url}: {err}"),
        }
    }

    pub async fn try_connect(url: &str, cookie: Option<&str>) -> Result<Self, tungstenite::Error> {
        let mut request = url.into_client_request()?;
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert(COOKIE, HeaderValue::from_str(cookie).expect("cookie header"));
        }
        let (ws, _response) = connect_async(request).await?;
        let mut client = Self { ws };
        client.ready().await;
        Ok(client)
    }

    /// Round-trip a harmless request so every plugin is known to be running.
    async fn ready(&mut self) {
        self.send("ready", MessageType::ChatGetMessages, json!({"chat_id": "0", "limit": 1}))
            .await;
        let reply = self.recv_seq("ready").await;
        assert_eq!(reply.message_type, MessageType::ChatGetMessages, "{reply:?}");
    }

    pub async fn send(&mut self, sequence_id: &str, message_type: MessageType, payload: Value) {
        let frame = Envelope::new(sequence_id, message_type, payload).expect("frame");
        self.send_raw(&frame.encode().expect("encode")).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send frame");
    }

    /// Next data frame, or `None` if nothing arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match next {
                Ok(Message::Text(text)) => return Some(Envelope::decode(text.as_bytes()).expect("decode frame")),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    pub async fn recv(&mut self) -> Envelope {
        self.recv_within(RECV_TIMEOUT).await.expect("expected a frame")
    }

    /// Skip frames until one correlated with `sequence_id` arrives.
    pub async fn recv_seq(&mut self, sequence_id: &str) -> Envelope {
        loop {
            let frame = self.recv().await;
            if frame.sequence_id == sequence_id {
                return frame;
            }
        }
    }

    /// Skip frames until one of `message_type` arrives.
    pub async fn recv_type(&mut self, message_type: MessageType) -> Envelope {
        loop {
            let frame = self.recv().await;
            if frame.message_type == message_type {
                return frame;
            }
        }
    }

    pub async fn request(&mut self, sequence_id: &str, message_type: MessageType, payload: Value) -> Envelope {
        self.send(sequence_id, message_type, payload).await;
        self.recv_seq(sequence_id).await
    }

    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Some(frame) = self.recv_within(wait).await {
            panic!("unexpected frame {frame:?}");
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Assert an `error:generic` frame with the given code and message.
pub fn assert_error(frame: &Envelope, code: &str, message: &str) {
    assert_eq!(frame.message_type, MessageType::ErrorGeneric, "{frame:?}");
    assert_eq!(frame.payload["code"], code, "{frame:?}");
    assert_eq!(frame.payload["error"], message, "{frame:?}");
}

// ============================================================================
// Fake workspace agent
// ============================================================================

/// One accepted agent socket and the `Authorization` header it was dialed with.
pub struct AgentConn {
    pub authorization: Option<String>,
    pub ws: WebSocketStream<TcpStream>,
}

impl AgentConn {
    pub async fn recv(&mut self) -> AgentEnvelope {
        loop {
            let next = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("agent frame in time")
                .expect("agent socket open")
                .expect("agent socket error");
            if let Message::Text(text) = next {
                return serde_json::from_str(text.as_str()).expect("agent envelope");
            }
        }
    }

    pub async fn send(&mut self, envelope: &AgentEnvelope) {
        let text = serde_json::to_string(envelope).expect("encode agent envelope");
        self.ws.send(Message::Text(text.into())).await.expect("agent send");
    }
}

pub struct FakeAgent {
    pub addr: SocketAddr,
    accepted: Mutex<tokio::sync::mpsc::Receiver<AgentConn>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake agent");
        let addr = listener.local_addr().expect("agent addr");
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(std::sync::Mutex::new(None));
                let header = captured.clone();
                let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    *header.lock().unwrap() = request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    Ok(response)
                };
                let Ok(ws) = accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let authorization = captured.lock().unwrap().take();
                if tx.send(AgentConn { authorization, ws }).await.is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            accepted: Mutex::new(rx),
            task,
        }
    }

    /// Base URL to register for a workspace agent.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept(&self) -> AgentConn {
        timeout(RECV_TIMEOUT, self.accepted.lock().await.recv())
            .await
            .expect("gateway dialed the agent")
            .expect("fake agent running")
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}
