//! Narrow capability traits for pushing set and map changes around, plus
//! the small decorators used to wire them together.

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hash};
use std::ops::ControlFlow;

pub trait Adder<T> {
    /// Returns whether anything changed.
    fn add(&mut self, item: T) -> bool;
}

pub trait Remover<T> {
    /// Returns whether anything changed.
    fn remove(&mut self, item: T) -> bool;
}

pub trait Putter<K, V> {
    fn put(&mut self, key: K, val: V);
}

pub trait Deleter<K> {
    fn delete(&mut self, key: K);
}

/// Whole-value push.
pub trait Receiver<W> {
    fn receive(&mut self, whole: W);
}

/// Enumeration with early exit.
pub trait Visitor<T> {
    fn visit(&self, f: &mut dyn FnMut(&T) -> ControlFlow<()>) -> ControlFlow<()>;
}

pub trait SetChangeReceiver<T>: Adder<T> + Remover<T> {}
impl<T, R: Adder<T> + Remover<T>> SetChangeReceiver<T> for R {}

pub trait MappingReceiver<K, V>: Putter<K, V> + Deleter<K> {}
impl<K, V, R: Putter<K, V> + Deleter<K>> MappingReceiver<K, V> for R {}

impl<T, R: Adder<T> + ?Sized> Adder<T> for &mut R {
    fn add(&mut self, item: T) -> bool { (**self).add(item) }
}

impl<T, R: Remover<T> + ?Sized> Remover<T> for &mut R {
    fn remove(&mut self, item: T) -> bool { (**self).remove(item) }
}

impl<K, V, R: Putter<K, V> + ?Sized> Putter<K, V> for &mut R {
    fn put(&mut self, key: K, val: V) { (**self).put(key, val) }
}

impl<K, R: Deleter<K> + ?Sized> Deleter<K> for &mut R {
    fn delete(&mut self, key: K) { (**self).delete(key) }
}

impl<T: Eq + Hash, S: BuildHasher> Adder<T> for HashSet<T, S> {
    fn add(&mut self, item: T) -> bool { self.insert(item) }
}

impl<T: Eq + Hash, S: BuildHasher> Remover<T> for HashSet<T, S> {
    fn remove(&mut self, item: T) -> bool { HashSet::remove(self, &item) }
}

impl<T: Eq + Hash, S: BuildHasher> Visitor<T> for HashSet<T, S> {
    fn visit(&self, f: &mut dyn FnMut(&T) -> ControlFlow<()>) -> ControlFlow<()> {
        self.iter().try_for_each(f)
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> Putter<K, V> for HashMap<K, V, S> {
    fn put(&mut self, key: K, val: V) { self.insert(key, val); }
}

impl<K: Eq + Hash, V, S: BuildHasher> Deleter<K> for HashMap<K, V, S> {
    fn delete(&mut self, key: K) { self.remove(&key); }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetChange<T> {
    Add(T),
    Remove(T),
}

impl<T> SetChange<T> {
    pub fn apply_to<R: SetChangeReceiver<T> + ?Sized>(self, r: &mut R) -> bool {
        match self {
            SetChange::Add(t) => r.add(t),
            SetChange::Remove(t) => r.remove(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapChange<K, V> {
    Put(K, V),
    Delete(K),
}

/// Records set changes in arrival order, for draining after the producer's
/// borrow ends.
#[derive(Debug, Clone)]
pub struct ChangeBuffer<T>(pub Vec<SetChange<T>>);

impl<T> Default for ChangeBuffer<T> {
    fn default() -> Self { Self(Vec::new()) }
}

impl<T> ChangeBuffer<T> {
    pub fn drain(&mut self) -> std::vec::Drain<'_, SetChange<T>> { self.0.drain(..) }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl<T> Adder<T> for ChangeBuffer<T> {
    fn add(&mut self, item: T) -> bool {
        self.0.push(SetChange::Add(item));
        true
    }
}

impl<T> Remover<T> for ChangeBuffer<T> {
    fn remove(&mut self, item: T) -> bool {
        self.0.push(SetChange::Remove(item));
        true
    }
}

#[derive(Debug, Clone)]
pub struct MappingBuffer<K, V>(pub Vec<MapChange<K, V>>);

impl<K, V> Default for MappingBuffer<K, V> {
    fn default() -> Self { Self(Vec::new()) }
}

impl<K, V> MappingBuffer<K, V> {
    pub fn drain(&mut self) -> std::vec::Drain<'_, MapChange<K, V>> { self.0.drain(..) }
}

impl<K, V> Putter<K, V> for MappingBuffer<K, V> {
    fn put(&mut self, key: K, val: V) { self.0.push(MapChange::Put(key, val)) }
}

impl<K, V> Deleter<K> for MappingBuffer<K, V> {
    fn delete(&mut self, key: K) { self.0.push(MapChange::Delete(key)) }
}

/// Sends every change to both receivers. The result is true if either changed.
pub struct Fork<A, B>(pub A, pub B);

impl<T: Clone, A: Adder<T>, B: Adder<T>> Adder<T> for Fork<A, B> {
    fn add(&mut self, item: T) -> bool {
        let a = self.0.add(item.clone());
        self.1.add(item) || a
    }
}

impl<T: Clone, A: Remover<T>, B: Remover<T>> Remover<T> for Fork<A, B> {
    fn remove(&mut self, item: T) -> bool {
        let a = self.0.remove(item.clone());
        self.1.remove(item) || a
    }
}

impl<K: Clone, V: Clone, A: Putter<K, V>, B: Putter<K, V>> Putter<K, V> for Fork<A, B> {
    fn put(&mut self, key: K, val: V) {
        self.0.put(key.clone(), val.clone());
        self.1.put(key, val);
    }
}

impl<K: Clone, A: Deleter<K>, B: Deleter<K>> Deleter<K> for Fork<A, B> {
    fn delete(&mut self, key: K) {
        self.0.delete(key.clone());
        self.1.delete(key);
    }
}

/// Transforms elements before forwarding them.
pub struct Mapped<R, F> {
    pub inner: R,
    pub f: F,
}

impl<T, U, R: Adder<U>, F: Fn(T) -> U> Adder<T> for Mapped<R, F> {
    fn add(&mut self, item: T) -> bool { self.inner.add((self.f)(item)) }
}

impl<T, U, R: Remover<U>, F: Fn(T) -> U> Remover<T> for Mapped<R, F> {
    fn remove(&mut self, item: T) -> bool { self.inner.remove((self.f)(item)) }
}
