//! Rate-limited, deduplicating work queue.
//!
//! Keys move through three sets:
//! - `queue`: FIFO of keys waiting for a worker
//! - `dirty`: keys that need processing (queued or re-added while in flight)
//! - `processing`: keys currently handed out by [`WorkQueue::get`]
//!
//! A key is never in `queue` while it is in `processing`, which is what keeps
//! two workers from reconciling the same key at the same time. A key added
//! while in flight stays dirty and is put back on the queue by
//! [`WorkQueue::done`].

use crate::backoff::ExponentialBackoff;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    backoff: ExponentialBackoff<T>,
    shutting_down: bool,
}

/// Work queue shared by the event router (producer) and the workers (consumers).
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Creates a named queue using the given failure backoff.
    pub fn new(name: &'static str, backoff: ExponentialBackoff<T>) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                backoff,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    // Every critical section leaves the sets consistent, so a poisoned lock
    // still holds usable state.
    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Marks `item` as needing processing.
    ///
    /// Idempotent: a key already waiting is not queued twice, and a key that is
    /// being processed is only queued again once its worker calls `done`.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            trace!("{}: {:?} already pending", self.name, item);
            return;
        }
        if state.processing.contains(&item) {
            trace!("{}: {:?} in flight, deferring until done", self.name, item);
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Blocks until a key is available.
    ///
    /// Returns `None` once the queue has been shut down; callers should stop
    /// consuming at that point.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an add between the check and
            // the await still wakes this waiter.
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as finished. Must be called exactly once per `get`.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-adds `item` after the key's current backoff delay and counts the failure.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.state().backoff.when(&item);
        debug!("{}: requeueing {:?} in {:?}", self.name, item, delay);
        self.add_after(item, delay);
    }

    /// Adds `item` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clears the failure count of `item`.
    pub fn forget(&self, item: &T) {
        self.state().backoff.forget(item);
    }

    /// Number of consecutive failures recorded for `item`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().backoff.num_requeues(item)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no key is waiting for a worker.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys; every blocked `get` returns `None`.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
#[path = "workqueue_test.rs"]
mod workqueue_test;
