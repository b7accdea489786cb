//! Single-assignment settlement cell.

use std::future::Future;

use tokio::sync::watch;

/// Settlement state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Resolved,
    Rejected,
}

/// A value that is settled at most once, observable any number of times.
///
/// The first `resolve`/`reject` wins. Observers created with [`Deferred::outcome`]
/// before or after settlement all see the same result. If the `Deferred` is
/// dropped while still pending, observers get `None`.
pub struct Deferred<T, E> {
    slot: watch::Sender<Option<Result<T, E>>>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    pub fn state(&self) -> DeferredState {
        match &*self.slot.borrow() {
            None => DeferredState::Pending,
            Some(Ok(_)) => DeferredState::Resolved,
            Some(Err(_)) => DeferredState::Rejected,
        }
    }

    /// Resolve with `value`. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject with `error`. Returns false if already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, result: Result<T, E>) -> bool {
        let mut result = Some(result);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = result.take();
            true
        })
    }

    /// Future resolving to the settled result.
    pub fn outcome(&self) -> impl Future<Output = Option<Result<T, E>>> + Send + 'static {
        let mut rx = self.slot.subscribe();
        async move {
            let settled = rx.wait_for(Option::is_some).await.ok()?;
            settled.clone()
        }
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
