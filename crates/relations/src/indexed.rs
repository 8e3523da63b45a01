//! Sets of tuples stored as nested indices.
//!
//! `SingleIndexedRelation3<A, B, C>` is `A -> (B -> {C})`; each level keeps an
//! entry only while something lies beneath it, so lifecycles follow from
//! emptiness rather than reference counts.

use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;

use placement_core::receivers::{Adder, Remover, Visitor};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::factorer::{self, Factorer};

/// A set of `T` that can enumerate itself.
pub trait Relation<T>: Adder<T> + Remover<T> {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
    fn contains(&self, t: &T) -> bool;
    fn for_each(&self, f: &mut dyn FnMut(T) -> ControlFlow<()>) -> ControlFlow<()>;
}

/// The innermost level: a plain set.
#[derive(Debug, Clone)]
pub struct Leaf<T>(FxHashSet<T>);

impl<T> Default for Leaf<T> {
    fn default() -> Self { Self(FxHashSet::default()) }
}

impl<T: Eq + Hash> Leaf<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ { self.0.iter() }
}

impl<T: Eq + Hash> Adder<T> for Leaf<T> {
    fn add(&mut self, item: T) -> bool { self.0.insert(item) }
}

impl<T: Eq + Hash> Remover<T> for Leaf<T> {
    fn remove(&mut self, item: T) -> bool { self.0.remove(&item) }
}

impl<T: Eq + Hash + Clone> Relation<T> for Leaf<T> {
    fn len(&self) -> usize { self.0.len() }
    fn contains(&self, t: &T) -> bool { self.0.contains(t) }
    fn for_each(&self, f: &mut dyn FnMut(T) -> ControlFlow<()>) -> ControlFlow<()> {
        self.0.iter().try_for_each(|t| f(t.clone()))
    }
}

/// A relation over `W`, indexed by the part of a factorer, with the rest
/// stored in an inner relation.
pub struct IndexedRelation<W, P, R, I> {
    factorer: Factorer<W, P, R>,
    make_inner: fn() -> I,
    index: FxHashMap<P, I>,
    len: usize,
}

impl<W, P: fmt::Debug, R, I: fmt::Debug> fmt::Debug for IndexedRelation<W, P, R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_map().entries(self.index.iter()).finish() }
}

impl<W, P, R, I> IndexedRelation<W, P, R, I>
where
    P: Eq + Hash + Clone,
    I: Relation<R>,
{
    pub fn with_factorer(factorer: Factorer<W, P, R>, make_inner: fn() -> I) -> Self {
        Self { factorer, make_inner, index: FxHashMap::default(), len: 0 }
    }

    /// The inner relation for one part.
    pub fn get(&self, part: &P) -> Option<&I> { self.index.get(part) }

    pub fn parts(&self) -> impl Iterator<Item = &P> + '_ { self.index.keys() }

    pub fn iter_parts(&self) -> impl Iterator<Item = (&P, &I)> + '_ { self.index.iter() }

    /// All tuples, collected.
    pub fn to_vec(&self) -> Vec<W>
    where
        W: Clone,
    {
        let mut out = Vec::with_capacity(self.len);
        let _ = Relation::<W>::for_each(self, &mut |w| {
            out.push(w);
            ControlFlow::Continue(())
        });
        out
    }
}

impl<W, P, R, I> Adder<W> for IndexedRelation<W, P, R, I>
where
    P: Eq + Hash + Clone,
    I: Relation<R>,
{
    fn add(&mut self, item: W) -> bool {
        let (part, rest) = self.factorer.first(item);
        let make = self.make_inner;
        let inner = self.index.entry(part).or_insert_with(make);
        let changed = inner.add(rest);
        if changed {
            self.len += 1;
        }
        changed
    }
}

impl<W, P, R, I> Remover<W> for IndexedRelation<W, P, R, I>
where
    P: Eq + Hash + Clone,
    I: Relation<R>,
{
    fn remove(&mut self, item: W) -> bool {
        let (part, rest) = self.factorer.first(item);
        let Some(inner) = self.index.get_mut(&part) else { return false };
        if !inner.remove(rest) {
            return false;
        }
        self.len -= 1;
        if inner.is_empty() {
            self.index.remove(&part);
        }
        true
    }
}

impl<W, P, R, I> Relation<W> for IndexedRelation<W, P, R, I>
where
    W: Clone,
    P: Eq + Hash + Clone,
    I: Relation<R>,
{
    fn len(&self) -> usize { self.len }

    fn contains(&self, t: &W) -> bool {
        let (part, rest) = self.factorer.first(t.clone());
        self.index.get(&part).is_some_and(|i| i.contains(&rest))
    }

    fn for_each(&self, f: &mut dyn FnMut(W) -> ControlFlow<()>) -> ControlFlow<()> {
        let fact = self.factorer;
        for (part, inner) in &self.index {
            inner.for_each(&mut |rest| f(fact.second(part.clone(), rest)))?;
        }
        ControlFlow::Continue(())
    }
}

impl<W, P, R, I> Visitor<W> for IndexedRelation<W, P, R, I>
where
    W: Clone,
    P: Eq + Hash + Clone,
    I: Relation<R>,
{
    fn visit(&self, f: &mut dyn FnMut(&W) -> ControlFlow<()>) -> ControlFlow<()> {
        Relation::<W>::for_each(self, &mut |w| f(&w))
    }
}

pub type SingleIndexedRelation2<A, B> = IndexedRelation<(A, B), A, B, Leaf<B>>;
pub type SingleIndexedRelation3<A, B, C> = IndexedRelation<(A, B, C), A, (B, C), SingleIndexedRelation2<B, C>>;
pub type SingleIndexedRelation4<A, B, C, D> =
    IndexedRelation<(A, B, C, D), A, (B, C, D), SingleIndexedRelation3<B, C, D>>;

impl<A, B> SingleIndexedRelation2<A, B>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
{
    pub fn new() -> Self { Self::with_factorer(factorer::pair(), Leaf::default) }
}

impl<A, B> Default for SingleIndexedRelation2<A, B>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
{
    fn default() -> Self { Self::new() }
}

impl<A, B, C> SingleIndexedRelation3<A, B, C>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
    C: Eq + Hash + Clone,
{
    pub fn new() -> Self { Self::with_factorer(factorer::triple_to_1_and_23(), SingleIndexedRelation2::new) }
}

impl<A, B, C> Default for SingleIndexedRelation3<A, B, C>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
    C: Eq + Hash + Clone,
{
    fn default() -> Self { Self::new() }
}

impl<A, B, C, D> SingleIndexedRelation4<A, B, C, D>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
    C: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    pub fn new() -> Self { Self::with_factorer(factorer::quad_to_1_and_234(), SingleIndexedRelation3::new) }
}

impl<A, B, C, D> Default for SingleIndexedRelation4<A, B, C, D>
where
    A: Eq + Hash + Clone,
    B: Eq + Hash + Clone,
    C: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation3_nested_lifecycle() {
        let mut r: SingleIndexedRelation3<&str, u8, char> = SingleIndexedRelation3::new();
        assert!(r.add(("a", 1, 'x')));
        assert!(!r.add(("a", 1, 'x')));
        assert!(r.add(("a", 2, 'y')));
        assert!(r.add(("b", 1, 'x')));
        assert_eq!(r.len(), 3);
        assert!(r.contains(&("a", 2, 'y')));
        assert_eq!(r.get(&"a").map(|i| i.len()), Some(2));
        assert_eq!(r.get(&"a").and_then(|i| i.get(&1)).map(|l| l.len()), Some(1));
        assert!(r.remove(("a", 1, 'x')));
        assert!(!r.remove(("a", 1, 'x')));
        assert!(r.get(&"a").and_then(|i| i.get(&1)).is_none(), "empty inner level must be dropped");
        assert!(r.remove(("a", 2, 'y')));
        assert!(r.get(&"a").is_none());
        assert_eq!(r.to_vec(), vec![("b", 1, 'x')]);
    }

    #[test]
    fn relation4_visit_stops_early() {
        let mut r: SingleIndexedRelation4<u8, u8, u8, u8> = SingleIndexedRelation4::new();
        for i in 0..10u8 {
            r.add((i % 2, i % 3, i, 0));
        }
        assert_eq!(r.len(), 10);
        let mut seen = 0;
        let flow = r.visit(&mut |_| {
            seen += 1;
            if seen == 4 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(seen, 4);
    }
}
