//! Fire-and-forget publishing of typed records.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tracing::{trace, warn};

use super::EventBus;

/// Encodes records and publishes them. Failures are logged and counted,
/// never returned.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    failures: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub async fn publish<T: Serialize>(&self, subject: &str, record: &T) {
        let payload = match plexus_protocol::bus::encode(record) {
            Ok(payload) => payload,
            Err(err) => {
                self.record_failure(subject, &err);
                return;
            }
        };
        match self.bus.publish(subject, Bytes::from(payload)).await {
            Ok(()) => trace!(subject, "published"),
            Err(err) => self.record_failure(subject, &err),
        }
    }

    /// Publishes that failed since startup.
    pub fn publish_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record_failure(&self, subject: &str, err: &dyn std::fmt::Display) {
        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(subject, error = %err, total, "bus publish failed");
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("failures", &self.publish_failures())
            .finish()
    }
}
