//! Per-connection state shared by the hub and its plugins.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use plexus_protocol::models::User;

use crate::auth::Identity;

/// The user behind a connection. The poller may swap it at any time, so
/// plugins load it right before each use instead of caching it.
#[derive(Debug, Clone)]
pub struct SessionUser {
    current: Arc<watch::Sender<Option<User>>>,
}

impl SessionUser {
    pub fn new(identity: Identity) -> Self {
        let (tx, _rx) = watch::channel(identity.into_user());
        Self { current: Arc::new(tx) }
    }

    pub fn anonymous() -> Self {
        Self::new(Identity::Anonymous)
    }

    /// Snapshot of the current user. `None` for anonymous connections.
    pub fn load(&self) -> Option<User> {
        self.current.borrow().clone()
    }

    pub fn id(&self) -> Option<i64> {
        self.current.borrow().as_ref().map(|u| u.id)
    }

    pub fn is_anonymous(&self) -> bool {
        self.current.borrow().is_none()
    }

    /// Replace the user. Anonymous connections never gain a user.
    pub fn store(&self, user: User) {
        self.current.send_if_modified(|slot| match slot {
            Some(existing) if *existing != user => {
                *existing = user;
                true
            }
            _ => false,
        });
    }

    pub fn watch(&self) -> watch::Receiver<Option<User>> {
        self.current.subscribe()
    }
}

/// Monotonic last-activity clock.
#[derive(Debug)]
pub struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since connect).
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// One live WebSocket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    ip: String,
    user: SessionUser,
    activity: Arc<Activity>,
    cancel: CancellationToken,
}

impl Connection {
    /// `parent` is the process-wide token; the connection scope is its child.
    pub fn new(identity: Identity, ip: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip: ip.into(),
            user: SessionUser::new(identity),
            activity: Arc::new(Activity::new()),
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn user(&self) -> &SessionUser {
        &self.user
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
