//! Process-wide FIFO admission queue with bounded concurrency.
//!
//! Tasks wait in a FIFO until one of `capacity` permits frees up. A single
//! dispatcher admits them strictly in order; nothing is polled, the dispatcher
//! sleeps on the semaphore and each admitted task releases its permit when it
//! settles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::task::{Task, TaskError, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("admission capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}

struct Fifo<T> {
    waiting: VecDeque<Arc<Task<T>>>,
    dispatching: bool,
}

pub struct AdmissionQueue<T> {
    capacity: usize,
    permits: Arc<Semaphore>,
    fifo: Arc<Mutex<Fifo<T>>>,
}

impl<T> AdmissionQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        Ok(Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            fifo: Arc::new(Mutex::new(Fifo {
                waiting: VecDeque::new(),
                dispatching: false,
            })),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted tasks that have not settled yet.
    pub fn running(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Number of tasks waiting for admission.
    pub fn waiting(&self) -> usize {
        self.fifo.lock().waiting.len()
    }

    /// Append `op` to the queue. Must be called inside a tokio runtime.
    pub fn enqueue<F, Fut>(&self, op: F) -> QueueHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task = Arc::new(Task::new(op));
        let start_dispatcher = {
            let mut fifo = self.fifo.lock();
            fifo.waiting.push_back(Arc::clone(&task));
            !std::mem::replace(&mut fifo.dispatching, true)
        };
        if start_dispatcher {
            tokio::spawn(dispatch(Arc::clone(&self.fifo), Arc::clone(&self.permits)));
        }
        QueueHandle {
            task,
            fifo: Arc::downgrade(&self.fifo),
        }
    }
}

async fn dispatch<T>(fifo: Arc<Mutex<Fifo<T>>>, permits: Arc<Semaphore>)
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        {
            let mut fifo = fifo.lock();
            if fifo.waiting.is_empty() {
                fifo.dispatching = false;
                return;
            }
        }
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            fifo.lock().dispatching = false;
            return;
        };
        // The head may have been canceled while we waited for a permit.
        let Some(task) = fifo.lock().waiting.pop_front() else {
            continue;
        };
        debug!(available = permits.available_permits(), "admitting task");
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = task.run().await {
                warn!(%err, "admitted task was not runnable");
            }
        });
    }
}

/// Caller-side view of an enqueued task.
pub struct QueueHandle<T> {
    task: Arc<Task<T>>,
    fifo: Weak<Mutex<Fifo<T>>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            fifo: Weak::clone(&self.fifo),
        }
    }
}

impl<T> QueueHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == TaskState::Pending
    }

    /// Remove the task from the queue and cancel it.
    ///
    /// Returns false, doing nothing, once the task has been admitted.
    pub fn cancel(&self) -> bool {
        let Some(fifo) = self.fifo.upgrade() else {
            return false;
        };
        let removed = {
            let mut fifo = fifo.lock();
            match fifo.waiting.iter().position(|t| Arc::ptr_eq(t, &self.task)) {
                Some(index) => fifo.waiting.remove(index).is_some(),
                None => false,
            }
        };
        removed && self.task.cancel().is_ok()
    }

    pub fn outcome(&self) -> impl Future<Output = Result<T, TaskError>> + Send + 'static {
        self.task.outcome()
    }
}
