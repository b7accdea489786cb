//! Tick/timeout/alert state machine.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Stopped,
    Ticking,
    Alerted,
}

/// Transition published on every status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    Tick,
    Stop,
    Alert,
}

struct Armed {
    status: WatchdogStatus,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    armed: Mutex<Armed>,
    events: broadcast::Sender<WatchdogEvent>,
}

/// A single re-armable timer. Goes to `Alerted` if not ticked within `timeout`.
pub struct Watchdog {
    timeout: Duration,
    shared: Arc<Shared>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            timeout,
            shared: Arc::new(Shared {
                armed: Mutex::new(Armed {
                    status: WatchdogStatus::Stopped,
                    generation: 0,
                    timer: None,
                }),
                events,
            }),
        }
    }

    pub fn status(&self) -> WatchdogStatus {
        self.shared.armed.lock().status
    }

    pub fn is_ticking(&self) -> bool {
        self.status() == WatchdogStatus::Ticking
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.shared.events.subscribe()
    }

    /// Re-arm the timer. Must be called inside a tokio runtime.
    pub fn tick(&self) {
        let mut armed = self.shared.armed.lock();
        armed.generation += 1;
        if let Some(timer) = armed.timer.take() {
            timer.abort();
        }
        armed.timer = Some(tokio::spawn(expire(
            Arc::downgrade(&self.shared),
            armed.generation,
            self.timeout,
        )));
        armed.status = WatchdogStatus::Ticking;
        let _ = self.shared.events.send(WatchdogEvent::Tick);
    }

    pub fn stop(&self) {
        let mut armed = self.shared.armed.lock();
        armed.generation += 1;
        if let Some(timer) = armed.timer.take() {
            timer.abort();
        }
        armed.status = WatchdogStatus::Stopped;
        let _ = self.shared.events.send(WatchdogEvent::Stop);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.armed.lock().timer.take() {
            timer.abort();
        }
    }
}

async fn expire(shared: Weak<Shared>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut armed = shared.armed.lock();
    // A tick or stop that raced with the sleep wins.
    if armed.generation != generation {
        return;
    }
    armed.timer = None;
    armed.status = WatchdogStatus::Alerted;
    let _ = shared.events.send(WatchdogEvent::Alert);
}
