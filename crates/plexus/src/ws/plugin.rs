//! The plugin contract.
//!
//! A plugin owns one slice of the message type namespace. The hub offers it
//! every inbound frame; it answers on its own outbound channel and may push
//! frames from its own background tasks at any time. Plugins never hold a
//! reference to the hub.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use plexus_protocol::Envelope;

use super::connection::Connection;
use super::error::FrameError;

/// Everything a plugin gets from the hub.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub conn: Connection,
    pub outbound: Outbound,
}

/// Send side of a plugin's outbound channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Envelope>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Queue a frame for the writer. Waits while the buffer is full; a closed
    /// connection drops the frame.
    pub async fn send(&self, frame: Envelope) {
        if self.tx.send(frame).await.is_err() {
            debug!("outbound channel closed, dropping frame");
        }
    }

    /// Serialize and queue a reply. A payload that fails to serialize is
    /// reported as a server error on the same sequence id.
    pub async fn reply(&self, request: &Envelope, payload: impl serde::Serialize) {
        self.send_as(&request.sequence_id, request.message_type.clone(), payload)
            .await;
    }

    /// Reply on the request's sequence id under a different message type.
    pub async fn reply_as(
        &self,
        request: &Envelope,
        message_type: plexus_protocol::MessageType,
        payload: impl serde::Serialize,
    ) {
        self.send_as(&request.sequence_id, message_type, payload).await;
    }

    /// Queue a server push with an empty sequence id.
    pub async fn push(&self, message_type: plexus_protocol::MessageType, payload: impl serde::Serialize) {
        self.send_as("", message_type, payload).await;
    }

    pub async fn error(&self, sequence_id: &str, err: FrameError) {
        self.send(err.into_envelope(sequence_id)).await;
    }

    async fn send_as(
        &self,
        sequence_id: &str,
        message_type: plexus_protocol::MessageType,
        payload: impl serde::Serialize,
    ) {
        let frame = Envelope::new(sequence_id, message_type, payload)
            .unwrap_or_else(|e| FrameError::server(e.to_string()).into_envelope(sequence_id));
        self.send(frame).await;
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one inbound frame. Frames of types the plugin does not own
    /// return `Ok(())` immediately. Long work belongs on a background task.
    async fn handle(&self, frame: &Envelope) -> Result<(), FrameError>;

    /// Release bus subscriptions and stop background tasks.
    async fn close(&self);
}

/// Builds one plugin per connection.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, ctx: PluginContext) -> anyhow::Result<Arc<dyn Plugin>>;
}
