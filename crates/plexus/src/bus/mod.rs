//! Event bus contract.
//!
//! Subjects are plain strings (see [`plexus_protocol::bus::subjects`]),
//! bodies are CBOR records. Delivery is at-least-once: with explicit ack a
//! handler must call [`Delivery::ack`] or the message comes back after the
//! ack wait. New subscribers only see messages published after they subscribe.

mod memory;
mod publisher;

pub use memory::InMemoryBus;
pub use publisher::EventPublisher;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;

use plexus_protocol::CodecError;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Handlers must ack each delivery.
    pub explicit_ack: bool,
    /// Start from the newest message rather than replaying history.
    pub deliver_new: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            explicit_ack: true,
            deliver_new: true,
        }
    }
}

/// Callback invoked for every delivery on a subscription. Deliveries on one
/// subscription are handled one at a time.
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(f(delivery)))
}

/// One message handed to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    subject: String,
    payload: Bytes,
    attempt: u32,
    acked: Arc<AtomicBool>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, payload: Bytes, attempt: u32) -> Self {
        Self {
            subject: subject.into(),
            payload,
            attempt,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 1 for the first delivery, higher for redeliveries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ack(&self) {
        self.acked.store(true, Ordering::Release);
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Decode the CBOR body.
    pub fn decode<T: DeserializeOwned>(&self) -> BusResult<T> {
        Ok(plexus_protocol::bus::decode(&self.payload)?)
    }
}

/// Handle for a live subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            subject: subject.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> BusResult<Subscription>;
}
