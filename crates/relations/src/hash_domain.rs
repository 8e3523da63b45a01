//! Equality and hashing supplied from outside the key type.
//!
//! A domain is a type-level pair of functions. [`DomainKey`] wraps a value so
//! that std collections use the domain's notion of equality; [`DomainSet`]
//! and [`DomainMap`] are the containers built on it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::ControlFlow;

use placement_core::receivers::{Adder, Deleter, Putter, Remover, Visitor};
use placement_core::UpsyncSet;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

pub trait HashDomain<T: ?Sized> {
    fn equal(a: &T, b: &T) -> bool;
    fn hash(t: &T) -> u64;
}

/// The type's own `Eq` and `Hash`.
pub struct NativeDomain;

impl<T: Eq + Hash + ?Sized> HashDomain<T> for NativeDomain {
    fn equal(a: &T, b: &T) -> bool { a == b }

    fn hash(t: &T) -> u64 {
        let mut h = FxHasher::default();
        t.hash(&mut h);
        h.finish()
    }
}

/// A slice read as a set: order and repetition do not matter.
pub struct SetDomain<D>(PhantomData<D>);

impl<T, D: HashDomain<T>> HashDomain<[T]> for SetDomain<D> {
    fn equal(a: &[T], b: &[T]) -> bool {
        a.iter().all(|x| b.iter().any(|y| D::equal(x, y))) && b.iter().all(|y| a.iter().any(|x| D::equal(x, y)))
    }

    fn hash(t: &[T]) -> u64 {
        let mut hs: Vec<u64> = t.iter().map(D::hash).collect();
        hs.sort_unstable();
        hs.dedup();
        hs.into_iter().fold(0u64, |acc, h| acc.wrapping_mul(31).wrapping_add(h))
    }
}

impl<T, D: HashDomain<T>> HashDomain<Vec<T>> for SetDomain<D> {
    fn equal(a: &Vec<T>, b: &Vec<T>) -> bool { <Self as HashDomain<[T]>>::equal(a, b) }
    fn hash(t: &Vec<T>) -> u64 { <Self as HashDomain<[T]>>::hash(t) }
}

/// Pairs compared component-wise.
pub struct PairDomain<DA, DB>(PhantomData<(DA, DB)>);

impl<A, B, DA: HashDomain<A>, DB: HashDomain<B>> HashDomain<(A, B)> for PairDomain<DA, DB> {
    fn equal(a: &(A, B), b: &(A, B)) -> bool { DA::equal(&a.0, &b.0) && DB::equal(&a.1, &b.1) }
    fn hash(t: &(A, B)) -> u64 { DA::hash(&t.0).wrapping_mul(257).wrapping_add(DB::hash(&t.1)) }
}

/// Upsync sets compare their pattern lists as sets.
pub struct UpsyncDomain;

impl HashDomain<UpsyncSet> for UpsyncDomain {
    fn equal(a: &UpsyncSet, b: &UpsyncSet) -> bool {
        type S = SetDomain<NativeDomain>;
        a.api_group == b.api_group
            && <S as HashDomain<[String]>>::equal(&a.resources, &b.resources)
            && <S as HashDomain<[String]>>::equal(&a.namespaces, &b.namespaces)
            && <S as HashDomain<[String]>>::equal(&a.names, &b.names)
    }

    fn hash(t: &UpsyncSet) -> u64 {
        type S = SetDomain<NativeDomain>;
        <NativeDomain as HashDomain<str>>::hash(&t.api_group)
            .wrapping_add(5u64.wrapping_mul(<S as HashDomain<[String]>>::hash(&t.resources)))
            .wrapping_add(37u64.wrapping_mul(<S as HashDomain<[String]>>::hash(&t.namespaces)))
            .wrapping_add(257u64.wrapping_mul(<S as HashDomain<[String]>>::hash(&t.names)))
    }
}

/// A value whose `Eq`/`Hash` come from the domain `D`.
pub struct DomainKey<T, D> {
    pub value: T,
    _d: PhantomData<fn() -> D>,
}

impl<T, D> DomainKey<T, D> {
    pub fn new(value: T) -> Self { Self { value, _d: PhantomData } }
    pub fn into_inner(self) -> T { self.value }
}

impl<T: Clone, D> Clone for DomainKey<T, D> {
    fn clone(&self) -> Self { Self::new(self.value.clone()) }
}

impl<T: fmt::Debug, D> fmt::Debug for DomainKey<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.value.fmt(f) }
}

impl<T, D: HashDomain<T>> PartialEq for DomainKey<T, D> {
    fn eq(&self, other: &Self) -> bool { D::equal(&self.value, &other.value) }
}

impl<T, D: HashDomain<T>> Eq for DomainKey<T, D> {}

impl<T, D: HashDomain<T>> Hash for DomainKey<T, D> {
    fn hash<H: Hasher>(&self, state: &mut H) { state.write_u64(D::hash(&self.value)) }
}

/// Borrowed form of [`DomainKey`], for lookups and diffing without clones.
pub(crate) struct DomainRef<'a, T, D>(pub(crate) &'a T, PhantomData<fn() -> D>);

impl<'a, T, D> DomainRef<'a, T, D> {
    pub(crate) fn new(t: &'a T) -> Self { Self(t, PhantomData) }
}

impl<T, D: HashDomain<T>> PartialEq for DomainRef<'_, T, D> {
    fn eq(&self, other: &Self) -> bool { D::equal(self.0, other.0) }
}

impl<T, D: HashDomain<T>> Eq for DomainRef<'_, T, D> {}

impl<T, D: HashDomain<T>> Hash for DomainRef<'_, T, D> {
    fn hash<H: Hasher>(&self, state: &mut H) { state.write_u64(D::hash(self.0)) }
}

pub struct DomainSet<T, D> {
    items: FxHashSet<DomainKey<T, D>>,
}

impl<T, D> Default for DomainSet<T, D> {
    fn default() -> Self { Self { items: FxHashSet::default() } }
}

impl<T: fmt::Debug, D: HashDomain<T>> fmt::Debug for DomainSet<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_set().entries(self.items.iter()).finish() }
}

impl<T: Clone, D: HashDomain<T>> DomainSet<T, D> {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn contains(&self, t: &T) -> bool { self.items.contains(&DomainKey::new(t.clone())) }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ { self.items.iter().map(|k| &k.value) }
}

impl<T: Clone, D: HashDomain<T>> Adder<T> for DomainSet<T, D> {
    fn add(&mut self, item: T) -> bool { self.items.insert(DomainKey::new(item)) }
}

impl<T: Clone, D: HashDomain<T>> Remover<T> for DomainSet<T, D> {
    fn remove(&mut self, item: T) -> bool { self.items.remove(&DomainKey::new(item)) }
}

impl<T: Clone, D: HashDomain<T>> Visitor<T> for DomainSet<T, D> {
    fn visit(&self, f: &mut dyn FnMut(&T) -> ControlFlow<()>) -> ControlFlow<()> {
        self.items.iter().try_for_each(|k| f(&k.value))
    }
}

pub struct DomainMap<K, V, D> {
    items: FxHashMap<DomainKey<K, D>, V>,
}

impl<K, V, D> Default for DomainMap<K, V, D> {
    fn default() -> Self { Self { items: FxHashMap::default() } }
}

impl<K: Clone, V, D: HashDomain<K>> DomainMap<K, V, D> {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, k: &K) -> Option<&V> { self.items.get(&DomainKey::new(k.clone())) }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ { self.items.iter().map(|(k, v)| (&k.value, v)) }
}

impl<K: Clone, V, D: HashDomain<K>> Putter<K, V> for DomainMap<K, V, D> {
    fn put(&mut self, key: K, val: V) { self.items.insert(DomainKey::new(key), val); }
}

impl<K: Clone, V, D: HashDomain<K>> Deleter<K> for DomainMap<K, V, D> {
    fn delete(&mut self, key: K) { self.items.remove(&DomainKey::new(key)); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(res: &[&str], names: &[&str]) -> UpsyncSet {
        UpsyncSet {
            api_group: "g1".into(),
            resources: res.iter().map(|s| s.to_string()).collect(),
            namespaces: vec!["*".into()],
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn upsync_domain_ignores_order_and_repeats() {
        let a = us(&["r1", "r2"], &["n1"]);
        let b = us(&["r2", "r1", "r2"], &["n1"]);
        assert!(UpsyncDomain::equal(&a, &b));
        assert_eq!(UpsyncDomain::hash(&a), UpsyncDomain::hash(&b), "equal values must hash alike");
        assert!(!UpsyncDomain::equal(&a, &us(&["r1"], &["n1"])));
    }

    #[test]
    fn domain_set_dedups_by_domain() {
        let mut s: DomainSet<UpsyncSet, UpsyncDomain> = DomainSet::default();
        assert!(s.add(us(&["r1", "r2"], &["n1"])));
        assert!(!s.add(us(&["r2", "r1"], &["n1"])));
        assert_eq!(s.len(), 1);
        assert!(s.remove(us(&["r1", "r2"], &["n1"])));
        assert!(s.is_empty());
    }

    #[test]
    fn domain_map_put_delete() {
        let mut m: DomainMap<(String, u32), &str, PairDomain<NativeDomain, NativeDomain>> = DomainMap::default();
        m.put(("a".into(), 1), "x");
        m.put(("a".into(), 1), "y");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&("a".into(), 1)), Some(&"y"));
        m.delete(("a".into(), 1));
        assert!(m.is_empty());
    }
}
