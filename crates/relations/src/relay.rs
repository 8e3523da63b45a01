use std::hash::Hash;
use std::sync::Arc;

use placement_core::lockorder::{LockRank, OrderedMutex};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Subscriber of a [`RelayMap`]. `None` means the key was released.
///
/// Called with the relay's lock held: implementations must not call back
/// into the relay nor take a lock that ranks before [`LockRank::RelayMap`].
pub trait RelayReceiver<K, V>: Send + Sync {
    fn set(&self, key: &K, val: Option<&V>);
}

struct RelayState<K, OV, IV> {
    map: FxHashMap<K, OV>,
    receivers: Vec<Arc<dyn RelayReceiver<K, IV>>>,
}

/// Latest value per key, pushed to every subscriber after projecting it
/// from the stored type `OV` to the published type `IV`.
pub struct RelayMap<K, OV, IV = OV> {
    state: OrderedMutex<RelayState<K, OV, IV>>,
    project: fn(&OV) -> IV,
    dedup: bool,
}

fn same<K, V>(a: &Arc<dyn RelayReceiver<K, V>>, b: &Arc<dyn RelayReceiver<K, V>>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

impl<K: Eq + Hash + Clone, V: Clone> RelayMap<K, V, V> {
    pub fn new(dedup: bool) -> Self { Self::with_projection(dedup, V::clone) }
}

impl<K: Eq + Hash + Clone, OV, IV> RelayMap<K, OV, IV> {
    /// `dedup` makes a second registration of the same receiver a no-op.
    pub fn with_projection(dedup: bool, project: fn(&OV) -> IV) -> Self {
        Self {
            state: OrderedMutex::new(LockRank::RelayMap, RelayState { map: FxHashMap::default(), receivers: Vec::new() }),
            project,
            dedup,
        }
    }

    pub fn set(&self, key: K, val: OV) {
        let mut st = self.state.lock();
        self.publish(&mut st, key, val);
    }

    /// Like [`set`](Self::set) but leaves an equal value alone, so
    /// receivers hear nothing. Returns whether `val` was published.
    pub fn update(&self, key: K, val: OV) -> bool
    where
        OV: PartialEq,
    {
        let mut st = self.state.lock();
        if st.map.get(&key) == Some(&val) {
            return false;
        }
        self.publish(&mut st, key, val);
        true
    }

    fn publish(&self, st: &mut RelayState<K, OV, IV>, key: K, val: OV) {
        let pub_val = (self.project)(&val);
        st.map.insert(key.clone(), val);
        for r in &st.receivers {
            r.set(&key, Some(&pub_val));
        }
    }

    pub fn get<T>(&self, key: &K, kont: impl FnOnce(Option<&OV>) -> T) -> T {
        let st = self.state.lock();
        kont(st.map.get(key))
    }

    pub fn len(&self) -> usize { self.state.lock().map.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Registers a receiver, optionally replaying current contents to it.
    /// Returns false when deduplication rejected it.
    pub fn add_receiver(&self, receiver: Arc<dyn RelayReceiver<K, IV>>, notify_current: bool) -> bool {
        let mut st = self.state.lock();
        if self.dedup && st.receivers.iter().any(|r| same(r, &receiver)) {
            return false;
        }
        if notify_current {
            for (k, v) in &st.map {
                receiver.set(k, Some(&(self.project)(v)));
            }
        }
        st.receivers.push(receiver);
        true
    }

    pub fn remove_receiver(&self, receiver: &Arc<dyn RelayReceiver<K, IV>>) -> bool {
        let mut st = self.state.lock();
        let before = st.receivers.len();
        st.receivers.retain(|r| !same(r, receiver));
        st.receivers.len() != before
    }

    /// Drops the key if `pred` approves its current value, then tells every
    /// receiver it is gone.
    pub fn maybe_release(&self, key: &K, pred: impl FnOnce(&OV) -> bool) -> bool {
        let mut st = self.state.lock();
        if !st.map.get(key).is_some_and(pred) {
            return false;
        }
        st.map.remove(key);
        trace!(receivers = st.receivers.len(), "relay key released");
        for r in &st.receivers {
            r.set(key, None);
        }
        true
    }

    pub fn remove(&self, key: &K) -> bool { self.maybe_release(key, |_| true) }

    pub fn keys(&self) -> Vec<K> { self.state.lock().map.keys().cloned().collect() }
}
