//! Cancellable unit of async work.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::deferred::Deferred;

type Operation<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Errored,
    Canceled,
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task was canceled")]
    Canceled,
    #[error("task was dropped before it settled")]
    Abandoned,
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("task is {0:?}, not pending")]
pub struct NotPending(pub TaskState);

enum Slot<T> {
    Pending(Operation<T>),
    Running,
    Done,
    Errored,
    Canceled,
}

impl<T> Slot<T> {
    fn state(&self) -> TaskState {
        match self {
            Slot::Pending(_) => TaskState::Pending,
            Slot::Running => TaskState::Running,
            Slot::Done => TaskState::Done,
            Slot::Errored => TaskState::Errored,
            Slot::Canceled => TaskState::Canceled,
        }
    }
}

pub struct Task<T> {
    slot: Mutex<Slot<T>>,
    settled: Deferred<T, TaskError>,
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(op: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            slot: Mutex::new(Slot::Pending(Box::new(move || op().boxed()))),
            settled: Deferred::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.slot.lock().state()
    }

    /// Run the operation and settle with its result.
    ///
    /// Errors without running anything if the task already left `Pending`.
    pub async fn run(&self) -> Result<(), NotPending> {
        let op = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Running) {
                Slot::Pending(op) => op,
                other => {
                    let state = other.state();
                    *slot = other;
                    return Err(NotPending(state));
                }
            }
        };

        match op().await {
            Ok(value) => {
                *self.slot.lock() = Slot::Done;
                self.settled.resolve(value);
            }
            Err(err) => {
                *self.slot.lock() = Slot::Errored;
                self.settled.reject(TaskError::Failed(Arc::new(err)));
            }
        }
        Ok(())
    }

    /// Settle as canceled without invoking the operation.
    pub fn cancel(&self) -> Result<(), NotPending> {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending(_)) {
            *slot = Slot::Canceled;
            drop(slot);
            self.settled.reject(TaskError::Canceled);
            Ok(())
        } else {
            Err(NotPending(slot.state()))
        }
    }

    pub fn outcome(&self) -> impl Future<Output = Result<T, TaskError>> + Send + 'static {
        let outcome = self.settled.outcome();
        async move { outcome.await.unwrap_or(Err(TaskError::Abandoned)) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn runs_operation_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42u32)
        });

        task.run().await.unwrap();
        let err = task.run().await.unwrap_err();

        assert_eq!(err.0, TaskState::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.outcome().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn failure_maps_to_errored() {
        let task: Task<()> = Task::new(|| async { Err(anyhow::anyhow!("compiler exploded")) });
        task.run().await.unwrap();

        assert_eq!(task.state(), TaskState::Errored);
        let err = task.outcome().await.unwrap_err();
        assert!(err.to_string().contains("compiler exploded"));
    }

    #[tokio::test]
    async fn cancel_skips_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = Task::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        task.cancel().unwrap();
        assert!(task.cancel().is_err());
        assert_eq!(task.run().await.unwrap_err().0, TaskState::Canceled);

        assert!(task.outcome().await.unwrap_err().is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_after_start_is_rejected() {
        let task = Task::new(|| async { Ok(1u8) });
        task.run().await.unwrap();
        assert_eq!(task.cancel().unwrap_err().0, TaskState::Done);
        assert_eq!(task.outcome().await.unwrap(), 1);
    }
}
