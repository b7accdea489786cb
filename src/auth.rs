//! Per-connection authorization liveness.
//!
//! Clients send `auth` heartbeats carrying their credential. Each heartbeat is
//! checked; a valid one re-arms a [`Watchdog`], an invalid one stops it. A
//! connection counts as authorized exactly while the watchdog is ticking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::watchdog::{Watchdog, WatchdogEvent};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Decides whether a credential token is currently valid.
pub trait Authorizer: Send + Sync + 'static {
    fn authorized(&self, token: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn authorized(&self, token: &str) -> bool {
        self(token)
    }
}

pub struct AuthLiveness {
    authorizer: Arc<dyn Authorizer>,
    watchdog: Watchdog,
}

impl AuthLiveness {
    pub fn new(authorizer: Arc<dyn Authorizer>, timeout: Duration) -> Self {
        Self {
            authorizer,
            watchdog: Watchdog::new(timeout),
        }
    }

    pub fn heartbeat(&self, token: &str) {
        if self.authorizer.authorized(token) {
            self.watchdog.tick();
        } else {
            self.watchdog.stop();
        }
    }

    pub fn authorized(&self) -> bool {
        self.watchdog.is_ticking()
    }

    /// Every tick, stop and alert.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.watchdog.subscribe()
    }
}
