//! Whole-value snapshots in, elemental changes out.
//!
//! Every operator here keeps exactly one snapshot, behind an `Arc` so that it
//! cannot be mutated after handoff. A delivery emits all of its removals
//! before any of its additions; re-delivering an equal value emits nothing.

use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use placement_core::receivers::{MappingReceiver, Receiver, SetChangeReceiver};
use placement_core::{ResolvedWhere, SinglePlacement, SinglePlacementSlice};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::hash_domain::{DomainRef, HashDomain};

/// Diffs slices whose elements are compared through the domain `D`.
pub struct SliceDifferencer<T, D, R> {
    current: Arc<[T]>,
    receiver: R,
    _d: PhantomData<fn() -> D>,
}

impl<T, D, R> SliceDifferencer<T, D, R>
where
    T: Clone,
    D: HashDomain<T>,
    R: SetChangeReceiver<T>,
{
    pub fn new(receiver: R) -> Self {
        Self { current: Arc::from(Vec::new()), receiver, _d: PhantomData }
    }

    pub fn current(&self) -> &Arc<[T]> { &self.current }
    pub fn receiver_mut(&mut self) -> &mut R { &mut self.receiver }
    pub fn into_receiver(self) -> R { self.receiver }
}

impl<T, D, R> Receiver<Arc<[T]>> for SliceDifferencer<T, D, R>
where
    T: Clone,
    D: HashDomain<T>,
    R: SetChangeReceiver<T>,
{
    fn receive(&mut self, next: Arc<[T]>) {
        if Arc::ptr_eq(&self.current, &next) {
            return;
        }
        {
            let old: FxHashSet<DomainRef<'_, T, D>> = self.current.iter().map(DomainRef::new).collect();
            let new: FxHashSet<DomainRef<'_, T, D>> = next.iter().map(DomainRef::new).collect();
            let mut done: FxHashSet<DomainRef<'_, T, D>> = FxHashSet::default();
            for t in self.current.iter() {
                let k = DomainRef::new(t);
                if !new.contains(&k) && done.insert(DomainRef::new(t)) {
                    self.receiver.remove(t.clone());
                }
            }
            done.clear();
            for t in next.iter() {
                let k = DomainRef::new(t);
                if !old.contains(&k) && done.insert(DomainRef::new(t)) {
                    self.receiver.add(t.clone());
                }
            }
        }
        self.current = next;
    }
}

/// Diffs maps: deletes for vanished keys, then puts for new or changed values.
pub struct MapDifferencer<K, V, R> {
    current: Arc<FxHashMap<K, V>>,
    receiver: R,
}

impl<K, V, R> MapDifferencer<K, V, R>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
    R: MappingReceiver<K, V>,
{
    pub fn new(receiver: R) -> Self { Self { current: Arc::new(FxHashMap::default()), receiver } }

    pub fn current(&self) -> &Arc<FxHashMap<K, V>> { &self.current }
    pub fn receiver_mut(&mut self) -> &mut R { &mut self.receiver }
}

impl<K, V, R> Receiver<Arc<FxHashMap<K, V>>> for MapDifferencer<K, V, R>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
    R: MappingReceiver<K, V>,
{
    fn receive(&mut self, next: Arc<FxHashMap<K, V>>) {
        if Arc::ptr_eq(&self.current, &next) {
            return;
        }
        for k in self.current.keys() {
            if !next.contains_key(k) {
                self.receiver.delete(k.clone());
            }
        }
        for (k, v) in next.iter() {
            match self.current.get(k) {
                Some(old) if old == v => {}
                _ => self.receiver.put(k.clone(), v.clone()),
            }
        }
        self.current = next;
    }
}

/// Reduces a where-resolution to the set of destinations it covers.
///
/// Slices are immutable, so slices are diffed by identity and only the
/// destinations of slices that came or went are examined. A destination
/// listed in several slices is counted once per listing and reported only
/// on the transitions between zero and non-zero.
pub struct SinglePlacementSliceSetReducer<R> {
    slices: Vec<Arc<SinglePlacementSlice>>,
    counts: FxHashMap<SinglePlacement, usize>,
    receiver: R,
}

impl<R: SetChangeReceiver<SinglePlacement>> SinglePlacementSliceSetReducer<R> {
    pub fn new(receiver: R) -> Self { Self { slices: Vec::new(), counts: FxHashMap::default(), receiver } }

    /// Destinations currently covered.
    pub fn destinations(&self) -> impl Iterator<Item = &SinglePlacement> + '_ { self.counts.keys() }

    pub fn receiver_mut(&mut self) -> &mut R { &mut self.receiver }
    pub fn into_receiver(self) -> R { self.receiver }
}

impl<R: SetChangeReceiver<SinglePlacement>> Receiver<ResolvedWhere> for SinglePlacementSliceSetReducer<R> {
    fn receive(&mut self, next: ResolvedWhere) {
        let (gone, came) = self.count_changes(&next);
        for d in gone {
            self.receiver.remove(d);
        }
        for d in came {
            self.receiver.add(d);
        }
        self.slices = next.0;
    }
}

impl<R> SinglePlacementSliceSetReducer<R> {
    fn count_changes(&mut self, next: &ResolvedWhere) -> (Vec<SinglePlacement>, Vec<SinglePlacement>) {
        let mut net: FxHashMap<usize, (isize, &Arc<SinglePlacementSlice>)> = FxHashMap::default();
        for s in &self.slices {
            net.entry(Arc::as_ptr(s) as usize).or_insert((0, s)).0 -= 1;
        }
        for s in &next.0 {
            net.entry(Arc::as_ptr(s) as usize).or_insert((0, s)).0 += 1;
        }
        let mut delta: FxHashMap<&SinglePlacement, isize> = FxHashMap::default();
        for (n, slice) in net.values() {
            if *n == 0 {
                continue;
            }
            for d in &slice.destinations {
                *delta.entry(d).or_insert(0) += *n;
            }
        }
        let mut gone = Vec::new();
        let mut came = Vec::new();
        for (d, n) in delta {
            if n == 0 {
                continue;
            }
            let before = self.counts.get(d).copied().unwrap_or(0);
            let after = (before as isize + n).max(0) as usize;
            if after == 0 {
                self.counts.remove(d);
            } else {
                self.counts.insert(d.clone(), after);
            }
            if before > 0 && after == 0 {
                gone.push(d.clone());
            } else if before == 0 && after > 0 {
                came.push(d.clone());
            }
        }
        (gone, came)
    }
}
