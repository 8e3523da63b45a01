//! Deduplicating work queue with per-item backoff.
//!
//! An item is in at most one of three places: queued, processing, or
//! neither. Adding an item that is being processed marks it dirty; `done`
//! puts a dirty item back at the tail.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use metrics::gauge;
use placement_core::config::EngineConfig;
use placement_core::lockorder::{LockRank, OrderedMutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::trace;

struct QueueState<T> {
    order: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    failures: FxHashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    state: OrderedMutex<QueueState<T>>,
    ready: Notify,
    config: EngineConfig,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: OrderedMutex::new(
                LockRank::WorkQueue,
                QueueState {
                    order: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    failures: FxHashMap::default(),
                    shutting_down: false,
                },
            ),
            ready: Notify::new(),
            config: config.clone(),
        }
    }

    /// Items waiting to be handed out.
    pub fn len(&self) -> usize { self.state.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add(&self, item: T) {
        let mut st = self.state.lock();
        if st.shutting_down || !st.dirty.insert(item.clone()) {
            return;
        }
        if st.processing.contains(&item) {
            trace!(?item, "marked dirty while processing");
            return;
        }
        st.order.push_back(item);
        gauge!("projector_queue_depth", st.order.len() as f64);
        drop(st);
        self.ready.notify_one();
    }

    /// Re-adds `item` once its backoff elapses. Needs a tokio runtime.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut st = self.state.lock();
            if st.shutting_down {
                return;
            }
            let n = st.failures.entry(item.clone()).or_insert(0);
            *n += 1;
            self.config.backoff(*n)
        };
        let me = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.add(item);
        });
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) { self.state.lock().failures.remove(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.state.lock().failures.get(item).copied().unwrap_or(0) }

    /// Next item without waiting.
    pub fn try_get(&self) -> Option<T> {
        let mut st = self.state.lock();
        let item = st.order.pop_front()?;
        st.dirty.remove(&item);
        st.processing.insert(item.clone());
        gauge!("projector_queue_depth", st.order.len() as f64);
        let more = !st.order.is_empty();
        drop(st);
        if more {
            // Chain the wakeup: one permit may stand for several adds.
            self.ready.notify_one();
        }
        Some(item)
    }

    /// Next item; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_get() {
                return Some(item);
            }
            if self.state.lock().shutting_down {
                return None;
            }
            notified.await;
        }
    }

    pub fn done(&self, item: &T) {
        let mut st = self.state.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.order.push_back(item.clone());
            drop(st);
            self.ready.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.state.lock().shutting_down }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> WorkQueue<&'static str> { WorkQueue::new(&EngineConfig::default()) }

    #[test]
    fn dedups_and_keeps_fifo_order() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get(), Some("a"));
        assert_eq!(q.try_get(), Some("b"));
        assert_eq!(q.try_get(), None);
    }

    #[test]
    fn dirty_while_processing_is_requeued_on_done() {
        let q = queue();
        q.add("a");
        let a = q.try_get().unwrap();
        q.add("a");
        assert_eq!(q.len(), 0, "not handed out twice concurrently");
        q.done(&a);
        assert_eq!(q.try_get(), Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_waiters() {
        let q = Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limited_items_come_back() {
        let q = Arc::new(queue());
        q.add_rate_limited("x");
        q.add_rate_limited("x");
        assert_eq!(q.num_requeues(&"x"), 2);
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
        assert_eq!(got, Some("x"));
        q.forget(&"x");
        assert_eq!(q.num_requeues(&"x"), 0);
    }
}
