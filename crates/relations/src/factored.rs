use std::hash::Hash;

use placement_core::receivers::{Deleter, Putter};
use rustc_hash::FxHashMap;

use crate::factorer::Factorer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome<V> {
    Created,
    /// Replaced an unequal value, which is returned.
    Updated(V),
    Unchanged,
}

impl<V> PutOutcome<V> {
    pub fn changed(&self) -> bool { !matches!(self, PutOutcome::Unchanged) }
}

/// A map from `W` to `V`, stored as `part -> rest -> V` where
/// `(part, rest)` comes from a [`Factorer`]. The outer map doubles as the
/// index by part; an outer entry lives exactly as long as its inner map is
/// non-empty.
pub struct GenericFactoredMap<W, P, R, V> {
    factorer: Factorer<W, P, R>,
    outer: FxHashMap<P, FxHashMap<R, V>>,
    len: usize,
}

impl<W, P, R, V> GenericFactoredMap<W, P, R, V>
where
    P: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
    V: PartialEq,
{
    pub fn new(factorer: Factorer<W, P, R>) -> Self {
        Self { factorer, outer: FxHashMap::default(), len: 0 }
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn put(&mut self, key: W, val: V) -> PutOutcome<V> {
        let (part, rest) = self.factorer.first(key);
        let inner = self.outer.entry(part).or_default();
        match inner.get_mut(&rest) {
            Some(old) if *old == val => PutOutcome::Unchanged,
            Some(old) => PutOutcome::Updated(std::mem::replace(old, val)),
            None => {
                inner.insert(rest, val);
                self.len += 1;
                PutOutcome::Created
            }
        }
    }

    pub fn delete(&mut self, key: W) -> Option<V> {
        let (part, rest) = self.factorer.first(key);
        let inner = self.outer.get_mut(&part)?;
        let old = inner.remove(&rest)?;
        self.len -= 1;
        if inner.is_empty() {
            self.outer.remove(&part);
        }
        Some(old)
    }

    pub fn get(&self, key: W) -> Option<&V> {
        let (part, rest) = self.factorer.first(key);
        self.outer.get(&part)?.get(&rest)
    }

    /// Everything stored under one part.
    pub fn get_index(&self, part: &P) -> Option<&FxHashMap<R, V>> { self.outer.get(part) }

    pub fn parts(&self) -> impl Iterator<Item = &P> + '_ { self.outer.keys() }

    pub fn visit(&self, mut f: impl FnMut(W, &V)) {
        for (part, inner) in &self.outer {
            for (rest, v) in inner {
                f(self.factorer.second(part.clone(), rest.clone()), v);
            }
        }
    }

    /// Visits the entries under one part, reassembled into whole keys.
    pub fn visit_part(&self, part: &P, mut f: impl FnMut(W, &V)) {
        if let Some(inner) = self.outer.get(part) {
            for (rest, v) in inner {
                f(self.factorer.second(part.clone(), rest.clone()), v);
            }
        }
    }
}

impl<W, P, R, V> Putter<W, V> for GenericFactoredMap<W, P, R, V>
where
    P: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
    V: PartialEq,
{
    fn put(&mut self, key: W, val: V) { GenericFactoredMap::put(self, key, val); }
}

impl<W, P, R, V> Deleter<W> for GenericFactoredMap<W, P, R, V>
where
    P: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
    V: PartialEq,
{
    fn delete(&mut self, key: W) { GenericFactoredMap::delete(self, key); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factorer;

    #[test]
    fn put_update_delete_and_outer_lifecycle() {
        let mut m: GenericFactoredMap<(u8, u8, u8), u8, (u8, u8), &str> =
            GenericFactoredMap::new(factorer::triple_to_1_and_23());
        assert_eq!(m.put((1, 2, 3), "a"), PutOutcome::Created);
        assert_eq!(m.put((1, 2, 3), "a"), PutOutcome::Unchanged);
        assert_eq!(m.put((1, 2, 3), "b"), PutOutcome::Updated("a"));
        assert_eq!(m.put((1, 4, 5), "c"), PutOutcome::Created);
        assert_eq!(m.len(), 2, "update is not a second insertion");
        assert_eq!(m.get_index(&1).map(|i| i.len()), Some(2));
        assert_eq!(m.delete((1, 2, 3)), Some("b"));
        assert_eq!(m.delete((1, 2, 3)), None);
        assert!(m.get_index(&1).is_some());
        assert_eq!(m.delete((1, 4, 5)), Some("c"));
        assert!(m.get_index(&1).is_none(), "empty part must be dropped");
        assert!(m.is_empty());
    }

    #[test]
    fn visit_reassembles_wholes() {
        let mut m: GenericFactoredMap<(u8, u8, u8), (u8, u8), u8, ()> =
            GenericFactoredMap::new(factorer::triple_to_13_and_2());
        m.put((1, 2, 3), ());
        m.put((4, 5, 6), ());
        let mut got = Vec::new();
        m.visit(|w, _| got.push(w));
        got.sort();
        assert_eq!(got, vec![(1, 2, 3), (4, 5, 6)]);
        let mut one = Vec::new();
        m.visit_part(&(1, 3), |w, _| one.push(w));
        assert_eq!(one, vec![(1, 2, 3)]);
    }
}
