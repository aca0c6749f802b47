//! The per-connection hub.
//!
//! ```text
//!            +--> plugin A --+
//! reader ----+--> plugin B --+--> select_all --> writer --> socket
//!            +--> plugin C --+        ^
//!                                     +-- hub errors, heartbeat pings
//! ```
//!
//! The reader offers each frame to every plugin in registration order. Each
//! plugin has its own bounded outbound channel; the writer merges them so all
//! socket writes are totally ordered.

use std::any::Any;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::stream::SelectAll;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use plexus_protocol::{Envelope, ErrorCode};

use super::connection::Connection;
use super::error::FrameError;
use super::plugin::{Outbound, Plugin, PluginContext, PluginFactory};
use crate::config::GatewayConfig;

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
    pub write_timeout: Duration,
    pub outbound_buffer: usize,
}

impl From<&GatewayConfig> for HubSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            max_missed_pongs: config.max_missed_pongs.max(1),
            write_timeout: config.write_timeout(),
            outbound_buffer: config.outbound_buffer.max(1),
        }
    }
}

pub struct Hub {
    conn: Connection,
    settings: HubSettings,
    plugins: Vec<Arc<dyn Plugin>>,
    outbound: Vec<mpsc::Receiver<Envelope>>,
    errors: Outbound,
    errors_rx: mpsc::Receiver<Envelope>,
}

impl Hub {
    pub fn new(conn: Connection, settings: HubSettings) -> Self {
        let (tx, errors_rx) = mpsc::channel(settings.outbound_buffer);
        Self {
            conn,
            settings,
            plugins: Vec::new(),
            outbound: Vec::new(),
            errors: Outbound::new(tx),
            errors_rx,
        }
    }

    /// Build a hub and register every factory. A plugin that fails to start
    /// is reported to the client once and left out.
    pub async fn with_plugins(
        conn: Connection,
        settings: HubSettings,
        factories: &[Arc<dyn PluginFactory>],
    ) -> Self {
        let mut hub = Self::new(conn, settings);
        for factory in factories {
            if let Err(err) = hub.register(factory.as_ref()).await {
                error!(plugin = factory.name(), error = %err, "plugin failed to start");
                hub.errors
                    .send(Envelope::error("", ErrorCode::ServerError, format!("{} unavailable", factory.name())))
                    .await;
            }
        }
        hub
    }

    pub async fn register(&mut self, factory: &dyn PluginFactory) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel(self.settings.outbound_buffer);
        let ctx = PluginContext {
            conn: self.conn.clone(),
            outbound: Outbound::new(tx),
        };
        let plugin = factory.create(ctx).await?;
        debug!(plugin = plugin.name(), "plugin registered");
        self.plugins.push(plugin);
        self.outbound.push(rx);
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Drive the connection until the client leaves, a write fails, the
    /// heartbeat gives up, or the connection scope is cancelled.
    pub async fn run<Si, St, E>(self, sink: Si, stream: St)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let Hub {
            conn,
            settings,
            plugins,
            outbound,
            errors,
            errors_rx,
        } = self;
        let cancel = conn.cancel_token().clone();
        let missed = Arc::new(AtomicU32::new(0));
        let (ping_tx, ping_rx) = mpsc::channel(1);

        let mut frames: SelectAll<ReceiverStream<Envelope>> =
            futures::stream::select_all(outbound.into_iter().map(ReceiverStream::new));
        frames.push(ReceiverStream::new(errors_rx));

        let writer = tokio::spawn(
            write_loop(sink, frames, ping_rx, settings.write_timeout, cancel.clone())
                .instrument(Span::current()),
        );
        let heartbeat = tokio::spawn(
            heartbeat_loop(
                ping_tx,
                missed.clone(),
                settings.ping_interval,
                settings.max_missed_pongs,
                cancel.clone(),
            )
            .instrument(Span::current()),
        );

        read_loop(stream, &conn, &plugins, &errors, &missed).await;
        cancel.cancel();

        for plugin in &plugins {
            if AssertUnwindSafe(plugin.close()).catch_unwind().await.is_err() {
                error!(plugin = plugin.name(), "plugin panicked while closing");
            }
        }
        let _ = writer.await;
        let _ = heartbeat.await;
        info!("connection closed");
    }
}

async fn read_loop<St, E>(
    mut stream: St,
    conn: &Connection,
    plugins: &[Arc<dyn Plugin>],
    errors: &Outbound,
    missed: &AtomicU32,
) where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = conn.cancel_token();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(error = %err, "read failed");
                break;
            }
            None => break,
        };
        match message {
            Message::Text(text) => {
                conn.activity().touch();
                dispatch(text.as_str().as_bytes(), plugins, errors).await;
            }
            Message::Binary(_) => debug!("ignoring binary frame"),
            Message::Pong(_) => missed.store(0, Ordering::Relaxed),
            // Pongs to client pings are sent by the transport.
            Message::Ping(_) => {}
            Message::Close(_) => {
                debug!("client closed");
                break;
            }
        }
    }
}

async fn dispatch(raw: &[u8], plugins: &[Arc<dyn Plugin>], errors: &Outbound) {
    let frame = match Envelope::decode(raw) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "malformed frame");
            errors
                .send(Envelope::error("", ErrorCode::BadRequest, "malformed frame"))
                .await;
            return;
        }
    };
    // Unknown agent types still reach the bridge, which answers them with an error.
    if frame.message_type.is_unknown() && frame.message_type.namespace() != "agent" {
        debug!(message_type = %frame.message_type, "dropping frame of unknown type");
        return;
    }

    for plugin in plugins {
        match AssertUnwindSafe(plugin.handle(&frame)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                match &err {
                    FrameError::Server(_) => warn!(
                        plugin = plugin.name(),
                        sequence_id = %frame.sequence_id,
                        message_type = %frame.message_type,
                        error = %err,
                        "frame failed"
                    ),
                    _ => debug!(
                        plugin = plugin.name(),
                        sequence_id = %frame.sequence_id,
                        error = %err,
                        "frame rejected"
                    ),
                }
                errors.error(&frame.sequence_id, err).await;
            }
            Err(panic) => {
                error!(
                    plugin = plugin.name(),
                    sequence_id = %frame.sequence_id,
                    message_type = %frame.message_type,
                    panic = panic_message(panic.as_ref()),
                    "plugin panicked"
                );
                errors
                    .send(Envelope::error(
                        frame.sequence_id.clone(),
                        ErrorCode::ServerError,
                        "internal server error",
                    ))
                    .await;
            }
        }
    }
}

async fn write_loop<Si>(
    mut sink: Si,
    mut frames: SelectAll<ReceiverStream<Envelope>>,
    mut pings: mpsc::Receiver<()>,
    write_timeout: Duration,
    cancel: CancellationToken,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(()) = pings.recv() => Message::Ping(Bytes::new()),
            Some(frame) = frames.next() => match frame.encode() {
                Ok(text) => Message::Text(text.into()),
                Err(err) => {
                    warn!(error = %err, "dropping unencodable frame");
                    continue;
                }
            },
            else => break,
        };
        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "write failed");
                break;
            }
            Err(_) => {
                warn!(timeout_ms = write_timeout.as_millis() as u64, "write timed out");
                break;
            }
        }
    }
    cancel.cancel();
    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
}

async fn heartbeat_loop(
    pings: mpsc::Sender<()>,
    missed: Arc<AtomicU32>,
    every: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let outstanding = missed.load(Ordering::Relaxed);
        if outstanding >= max_missed {
            warn!(missed = outstanding, "heartbeat lost, closing connection");
            cancel.cancel();
            return;
        }
        missed.fetch_add(1, Ordering::Relaxed);
        if pings.send(()).await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
