//! Periodic refresh of the connection's user.
//!
//! Busy connections refresh often, idle ones rarely. Between the warm and
//! cold thresholds the cadence is left where it was.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::connection::Connection;
use crate::config::UserPollConfig;
use crate::store::UserStore;

/// Next poll interval given how long the connection has been idle.
pub fn poll_interval(idle: Duration, current: Duration, config: &UserPollConfig) -> Duration {
    let idle_ms = idle.as_millis() as u64;
    if idle_ms < config.hot_below_ms {
        Duration::from_millis(config.hot_ms)
    } else if idle_ms < config.warm_below_ms {
        Duration::from_millis(config.warm_ms)
    } else if idle_ms >= config.cold_after_ms {
        Duration::from_millis(config.cold_ms)
    } else {
        current
    }
}

/// Refresh the user until the connection closes. Returns immediately for
/// anonymous connections.
pub async fn run_user_poller(conn: Connection, users: Arc<dyn UserStore>, config: UserPollConfig) {
    let Some(user_id) = conn.user().id() else {
        return;
    };
    let cancel = conn.cancel_token().clone();
    let mut every = Duration::from_millis(config.hot_ms);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }

        match users.get_user(user_id).await {
            Ok(Some(user)) => conn.user().store(user),
            Ok(None) => warn!(user_id, "user disappeared, keeping previous record"),
            Err(err) => warn!(user_id, error = %err, "user refresh failed"),
        }

        let next = poll_interval(conn.activity().idle(), every, &config);
        if next != every {
            debug!(user_id, interval_ms = next.as_millis() as u64, "user poll cadence changed");
            every = next;
        }
    }
}
