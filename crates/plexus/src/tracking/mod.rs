//! Usage tracking plugin.
//!
//! Best-effort ingestion of `tracking:record` frames. Records are enriched
//! with the connection's IP, its user (if any) and the server clock, then
//! written through [`WebUsageStore`]. The client never gets a reply, not
//! even for a malformed record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use validator::Validate;

use plexus_protocol::{Envelope, MessageType};

use crate::store::{WebUsage, WebUsageStore};
use crate::ws::{Connection, FrameError, Plugin, PluginContext, PluginFactory, parse_payload};

#[derive(Debug, Deserialize, Validate)]
struct RecordParams {
    #[serde(default)]
    #[validate(length(min = 1))]
    host: String,
    #[validate(required)]
    event: Option<i32>,
    #[serde(default)]
    #[validate(length(min = 1))]
    path: String,
    #[serde(default)]
    timespent: Option<i64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    metadata: Option<Value>,
}

pub struct TrackingPluginFactory {
    usage: Arc<dyn WebUsageStore>,
}

impl TrackingPluginFactory {
    pub fn new(usage: Arc<dyn WebUsageStore>) -> Self {
        Self { usage }
    }
}

#[async_trait]
impl PluginFactory for TrackingPluginFactory {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn create(&self, ctx: PluginContext) -> anyhow::Result<Arc<dyn Plugin>> {
        Ok(Arc::new(TrackingPlugin {
            conn: ctx.conn,
            usage: self.usage.clone(),
        }))
    }
}

pub struct TrackingPlugin {
    conn: Connection,
    usage: Arc<dyn WebUsageStore>,
}

#[async_trait]
impl Plugin for TrackingPlugin {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn handle(&self, frame: &Envelope) -> Result<(), FrameError> {
        if frame.message_type != MessageType::TrackingRecord {
            return Ok(());
        }

        let params: RecordParams = match parse_payload(frame) {
            Ok(params) => params,
            Err(err) => {
                debug!(error = %err, "dropping invalid usage record");
                return Ok(());
            }
        };
        let Some(event) = params.event else {
            return Ok(());
        };

        let usage = WebUsage {
            user_id: self.conn.user().id(),
            ip: self.conn.ip().to_string(),
            host: params.host,
            event,
            path: params.path,
            timespent: params.timespent,
            latitude: params.latitude,
            longitude: params.longitude,
            metadata: params.metadata,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.usage.record_usage(usage).await {
            warn!(error = %err, "failed to record usage");
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::store::StoreResult;
    use crate::ws::Outbound;
    use plexus_protocol::models::User;
    use serde_json::json;
    use tokio::sync::{Mutex, mpsc};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<WebUsage>>);

    #[async_trait]
    impl WebUsageStore for Recorded {
        async fn record_usage(&self, usage: WebUsage) -> StoreResult<()> {
            self.0.lock().await.push(usage);
            Ok(())
        }
    }

    async fn plugin(identity: Identity) -> (Arc<dyn Plugin>, Arc<Recorded>, mpsc::Receiver<Envelope>) {
        let store = Arc::new(Recorded::default());
        let conn = Connection::new(identity, "203.0.113.9", &CancellationToken::new());
        let (tx, rx) = mpsc::channel(4);
        let plugin = TrackingPluginFactory::new(store.clone())
            .create(PluginContext {
                conn,
                outbound: Outbound::new(tx),
            })
            .await
            .unwrap();
        (plugin, store, rx)
    }

    fn record(payload: Value) -> Envelope {
        Envelope::new("t1", MessageType::TrackingRecord, payload).unwrap()
    }

    #[tokio::test]
    async fn enriches_and_persists_without_reply() {
        let user = User {
            id: 7,
            user_name: "ada".into(),
            tier: 3,
        };
        let (plugin, store, mut rx) = plugin(Identity::User(user)).await;
        let before = Utc::now();

        plugin
            .handle(&record(json!({
                "host": "example.com", "event": 3, "path": "/home", "timespent": 1200,
                "metadata": {"ref": "nav"}
            })))
            .await
            .unwrap();

        let rows = store.0.lock().await;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.user_id, Some(7));
        assert_eq!(row.ip, "203.0.113.9");
        assert_eq!((row.host.as_str(), row.event, row.path.as_str()), ("example.com", 3, "/home"));
        assert_eq!(row.timespent, Some(1200));
        assert!(row.timestamp >= before);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn anonymous_records_have_no_user() {
        let (plugin, store, _rx) = plugin(Identity::Anonymous).await;
        plugin
            .handle(&record(json!({"host": "h", "event": 0, "path": "/"})))
            .await
            .unwrap();
        assert_eq!(store.0.lock().await[0].user_id, None);
    }

    #[tokio::test]
    async fn invalid_records_are_dropped_silently() {
        let (plugin, store, mut rx) = plugin(Identity::Anonymous).await;
        for payload in [
            json!({"host": "", "event": 1, "path": "/"}),
            json!({"host": "h", "path": "/"}),
            json!({"host": "h", "event": "click", "path": "/"}),
        ] {
            plugin.handle(&record(payload)).await.unwrap();
        }
        assert!(store.0.lock().await.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
