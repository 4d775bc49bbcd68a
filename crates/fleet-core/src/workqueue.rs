//! A generic per-kind FIFO work queue with enqueue dedup:
//! "Work items are the (namespace, name) identities of management-plane
//! objects; the queue collapses multiple enqueues to one." Built on an
//! `IndexSet` (insertion-order iteration, `insert` is naturally
//! idempotent) guarded by a `Mutex` and signaled by a `Notify`: no
//! thread-per-queue, just a task parked on an async wait.
//!
//! Dedup alone is not enough to satisfy "handlers for the same object
//! serialize through the queue" (spec §5): a key can be re-enqueued
//! (e.g. a watch event) while its previous dequeue is still being
//! processed. The queue therefore also tracks an `in_flight` set; an
//! enqueue for a key already in flight is recorded as "dirty" rather
//! than handed out a second time, and is re-dequeued only once the
//! in-flight invocation finishes — the same "dirty bit" discipline
//! client-go's `workqueue.Interface` uses to guarantee at-most-one
//! concurrent handler per key.

use std::{
    collections::HashSet,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

use indexmap::IndexSet;
use tokio::sync::Notify;

use crate::{ErrorKind, ratelimit::ExponentialBackoff};

struct State<K> {
    pending: IndexSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
}

/// A FIFO set of pending work items of type `K`. `K` is usually a
/// `(String, String)` namespace/name pair, but is generic so the same
/// queue type serves `Deployment`, `Source`, `Bundle`, and `Cluster`
/// reconcilers alike.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: IndexSet::new(),
                in_flight: HashSet::new(),
                dirty: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue `key`. A key already pending is left in its original FIFO
    /// position (the defining dedup behavior). A key currently being
    /// handled is marked dirty instead of re-queued, and is re-enqueued
    /// automatically when [`Self::done`] observes the dirty bit.
    pub fn enqueue(&self, key: K)
    where
        K: Clone,
    {
        let newly_inserted = {
            #[expect(clippy::unwrap_used, reason = "workqueue mutex is never held across a panic")]
            let mut state = self.state.lock().unwrap();
            if state.in_flight.contains(&key) {
                state.dirty.insert(key);
                false
            } else {
                state.pending.insert(key)
            }
        };
        if newly_inserted {
            self.notify.notify_one();
        }
    }

    /// Pop the oldest pending key not already in flight, if any, without
    /// blocking, marking it in flight.
    fn try_dequeue(&self) -> Option<K>
    where
        K: Clone,
    {
        #[expect(clippy::unwrap_used, reason = "workqueue mutex is never held across a panic")]
        let mut state = self.state.lock().unwrap();
        let key = state.pending.shift_remove_index(0)?;
        state.in_flight.insert(key.clone());
        Some(key)
    }

    /// Pop the oldest pending key, waiting on new work if the queue is
    /// currently empty. This is the queue's one suspension point.
    pub async fn dequeue(&self) -> K
    where
        K: Clone,
    {
        loop {
            if let Some(key) = self.try_dequeue() {
                return key;
            }
            self.notify.notified().await;
        }
    }

    /// Mark `key`'s in-flight invocation finished. If it was enqueued
    /// again while in flight (the dirty bit), it re-joins the pending
    /// set immediately so the handler observes the newer desired state.
    fn done(&self, key: K)
    where
        K: Clone,
    {
        let requeue = {
            #[expect(clippy::unwrap_used, reason = "workqueue mutex is never held across a panic")]
            let mut state = self.state.lock().unwrap();
            state.in_flight.remove(&key);
            state.dirty.remove(&key)
        };
        if requeue {
            self.enqueue(key);
        }
    }

    pub fn len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "workqueue mutex is never held across a panic")]
        let state = self.state.lock().unwrap();
        state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drive `queue` with up to `concurrency` concurrently-running handler
/// invocations, never more than one in flight per key at a time — a second
/// enqueue for a key already running is recorded as dirty by the queue and
/// re-dequeued only once the first invocation's [`WorkQueue::done`] call
/// observes it, satisfying "handlers for the same deployment run serially".
///
/// On success a key's back-off state is forgotten; on a
/// [`ErrorKind::requeues_with_backoff`] error it is re-enqueued after the
/// computed delay. Any other error kind is left for the caller to have
/// already surfaced onto the object's status — it is not retried for
/// non-transient error classes.
pub async fn drive<K, Fut, H>(queue: Arc<WorkQueue<K>>, concurrency: usize, handler: H) -> !
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorKind>> + Send + 'static,
    H: Fn(K) -> Fut + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let backoff = Arc::new(tokio::sync::Mutex::new(ExponentialBackoff::<K>::new()));
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency.max(1)));

    loop {
        let key = queue.dequeue().await;
        #[expect(clippy::unwrap_used, reason = "semaphore is never closed")]
        let permit = semaphore.clone().acquire_owned().await.unwrap();

        let queue = queue.clone();
        let backoff = backoff.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match handler(key.clone()).await {
                Ok(()) => backoff.lock().await.forget(&key),
                Err(kind) if kind.requeues_with_backoff() => {
                    let delay = backoff.lock().await.failure(key.clone());
                    let queue_for_backoff = queue.clone();
                    let backoff_key = key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue_for_backoff.enqueue(backoff_key);
                    });
                }
                Err(_) => {}
            }
            queue.done(key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_concurrent_enqueues() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("a");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_is_fifo() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("c");
        assert_eq!(queue.try_dequeue(), Some("a"));
        assert_eq!(queue.try_dequeue(), Some("b"));
        assert_eq!(queue.try_dequeue(), Some("c"));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn enqueue_while_in_flight_defers_instead_of_running_concurrently() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue("a");
        assert_eq!(queue.try_dequeue(), Some("a"));
        // "a" is now in flight; re-enqueuing it must not hand it out again
        // until `done` is called.
        queue.enqueue("a");
        assert_eq!(queue.try_dequeue(), None, "in-flight key must not be dequeued twice");
        queue.done("a");
        assert_eq!(queue.try_dequeue(), Some("a"), "dirty key re-joins the pending set once its handler finishes");
    }

    #[test]
    fn done_without_dirty_bit_does_not_requeue() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        queue.enqueue("a");
        assert_eq!(queue.try_dequeue(), Some("a"));
        queue.done("a");
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn dequeue_waits_for_new_work() {
        let queue: WorkQueue<&str> = WorkQueue::new();
        let enqueue_after_delay = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            queue.enqueue("late");
        };
        let (item, ()) = tokio::join!(queue.dequeue(), enqueue_after_delay);
        assert_eq!(item, "late");
    }

    #[tokio::test]
    async fn drive_invokes_the_handler_for_each_enqueued_key() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        queue.enqueue("a");
        queue.enqueue("b");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(queue, 4, move |key| {
            let tx = tx.clone();
            async move {
                #[expect(clippy::unwrap_used, reason = "test channel is never dropped early")]
                tx.send(key).unwrap();
                Ok(())
            }
        }));

        let mut seen = std::collections::HashSet::new();
        seen.insert(rx.recv().await.expect("first key"));
        seen.insert(rx.recv().await.expect("second key"));
        assert_eq!(seen, std::collections::HashSet::from(["a", "b"]));

        driver.abort();
    }
}
