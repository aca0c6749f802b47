//! In-process bus with per-subject fan-out and ack-driven redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{BusError, BusResult, Delivery, EventBus, Handler, SubscribeOptions, Subscription};

#[derive(Debug, Clone)]
struct Pending {
    payload: Bytes,
    attempt: u32,
}

#[derive(Debug, Default)]
struct Inner {
    subjects: DashMap<String, HashMap<u64, mpsc::UnboundedSender<Pending>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn remove(&self, subject: &str, id: u64) {
        if let Some(mut subs) = self.subjects.get_mut(subject) {
            subs.remove(&id);
        }
        self.subjects.remove_if(subject, |_, subs| subs.is_empty());
    }
}

/// Single-process [`EventBus`]. Each subscription gets its own delivery task.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
    ack_wait: Duration,
    max_deliver: u32,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 5)
    }
}

impl InMemoryBus {
    pub fn new(ack_wait: Duration, max_deliver: u32) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            ack_wait,
            max_deliver: max_deliver.max(1),
        }
    }

    /// Refuse further publishes and subscribes. Live subscriptions drain.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subjects.clear();
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner.subjects.get(subject).map_or(0, |subs| subs.len())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let Some(subs) = self.inner.subjects.get(subject) else {
            trace!(subject, "publish with no subscribers");
            return Ok(());
        };
        for tx in subs.values() {
            let _ = tx.send(Pending {
                payload: payload.clone(),
                attempt: 1,
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Handler,
    ) -> BusResult<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let redeliver = tx.downgrade();
        self.inner
            .subjects
            .entry(subject.to_string())
            .or_default()
            .insert(id, tx);

        tokio::spawn(deliver_loop(
            subject.to_string(),
            rx,
            redeliver,
            handler,
            options,
            self.ack_wait,
            self.max_deliver,
        ));
        debug!(subject, id, "bus subscription created");

        let inner = Arc::downgrade(&self.inner);
        let owned_subject = subject.to_string();
        Ok(Subscription::new(subject, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(&owned_subject, id);
            }
        }))
    }
}

async fn deliver_loop(
    subject: String,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    redeliver: mpsc::WeakUnboundedSender<Pending>,
    handler: Handler,
    options: SubscribeOptions,
    ack_wait: Duration,
    max_deliver: u32,
) {
    while let Some(pending) = rx.recv().await {
        let delivery = Delivery::new(subject.clone(), pending.payload.clone(), pending.attempt);
        handler(delivery.clone()).await;

        if !options.explicit_ack || delivery.is_acked() {
            continue;
        }
        if pending.attempt >= max_deliver {
            warn!(subject = %subject, attempts = pending.attempt, "dropping unacked message");
            continue;
        }

        let weak = redeliver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ack_wait).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Pending {
                    payload: pending.payload,
                    attempt: pending.attempt + 1,
                });
            }
        });
    }
    debug!(subject = %subject, "bus subscription closed");
}
