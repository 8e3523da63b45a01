//! The five write sections of a projector transaction, each with the
//! indices the projector reads back.

use placement_core::receivers::{Adder, Deleter, Putter, Remover};
use placement_core::{
    ClusterName, Distribution, DistributionBits, GroupResource, ProjectionModeKey, ProjectionModeVal, SinglePlacement,
    SourceObject, UpsyncSet,
};
use placement_relations::indexed::Relation;
use placement_relations::{
    DomainKey, GenericFactoredMap, Rotator, SingleIndexedRelation2, SingleIndexedRelation3, SingleIndexedRelation4,
    UpsyncDomain,
};
use rustc_hash::{FxHashMap, FxHashSet};

pub(crate) struct DistributionSection<O: SourceObject> {
    bits: FxHashMap<Distribution<O>, DistributionBits>,
    /// (source cluster, group-resource, object, destination)
    by_source: SingleIndexedRelation4<ClusterName, GroupResource, O::Local, SinglePlacement>,
    /// (destination, group-resource, (object, source cluster))
    by_destination: SingleIndexedRelation3<SinglePlacement, GroupResource, (O::Local, ClusterName)>,
    changed: FxHashSet<Distribution<O>>,
}

impl<O: SourceObject> DistributionSection<O> {
    pub(crate) fn new() -> Self {
        Self {
            bits: FxHashMap::default(),
            by_source: SingleIndexedRelation4::new(),
            by_destination: SingleIndexedRelation3::new(),
            changed: FxHashSet::default(),
        }
    }

    pub(crate) fn len(&self) -> usize { self.bits.len() }

    pub(crate) fn get(&self, t: &Distribution<O>) -> Option<DistributionBits> { self.bits.get(t).copied() }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Distribution<O>, &DistributionBits)> + '_ { self.bits.iter() }

    pub(crate) fn take_changed(&mut self) -> Vec<Distribution<O>> { self.changed.drain().collect() }

    fn index(&mut self, t: &Distribution<O>, add: bool) {
        let (cluster, local) = t.object.clone().split();
        let gr = t.key.group_resource.clone();
        let dest = t.key.destination.clone();
        let s = (cluster.clone(), gr.clone(), local.clone(), dest.clone());
        let d = (dest, gr, (local, cluster));
        if add {
            self.by_source.add(s);
            self.by_destination.add(d);
        } else {
            self.by_source.remove(s);
            self.by_destination.remove(d);
        }
    }

    /// Whether `cluster` has any live distribution of `gr`.
    pub(crate) fn source_has(&self, cluster: &ClusterName, gr: &GroupResource) -> bool {
        self.by_source.get(cluster).and_then(|r| r.get(gr)).is_some()
    }

    /// Destinations that get anything of `gr` from `cluster`.
    pub(crate) fn destinations_of_source(&self, cluster: &ClusterName, gr: &GroupResource) -> FxHashSet<SinglePlacement> {
        let mut out = FxHashSet::default();
        if let Some(by_obj) = self.by_source.get(cluster).and_then(|r| r.get(gr)) {
            for (_, dests) in by_obj.iter_parts() {
                out.extend(dests.iter().cloned());
            }
        }
        out
    }

    /// Destinations of one source object.
    pub(crate) fn destinations_of(&self, cluster: &ClusterName, gr: &GroupResource, local: &O::Local) -> Vec<SinglePlacement> {
        self.by_source
            .get(cluster)
            .and_then(|r| r.get(gr))
            .and_then(|r| r.get(local))
            .map(|leaf| leaf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Objects of `gr` going to `dest`, with their source clusters.
    pub(crate) fn at(&self, dest: &SinglePlacement, gr: &GroupResource) -> Vec<(O::Local, ClusterName)> {
        self.by_destination
            .get(dest)
            .and_then(|r| r.get(gr))
            .map(|leaf| leaf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Everything going to `dest`, grouped by group-resource.
    pub(crate) fn for_destination(&self, dest: &SinglePlacement, mut f: impl FnMut(&GroupResource, &O::Local)) {
        if let Some(by_gr) = self.by_destination.get(dest) {
            for (gr, objs) in by_gr.iter_parts() {
                for (local, _) in objs.iter() {
                    f(gr, local);
                }
            }
        }
    }

    pub(crate) fn destinations(&self) -> impl Iterator<Item = &SinglePlacement> + '_ { self.by_destination.parts() }

    /// Index sizes, for consistency checks.
    pub(crate) fn index_lens(&self) -> (usize, usize, usize) {
        (self.bits.len(), Relation::len(&self.by_source), Relation::len(&self.by_destination))
    }
}

impl<O: SourceObject> Putter<Distribution<O>, DistributionBits> for DistributionSection<O> {
    fn put(&mut self, key: Distribution<O>, val: DistributionBits) {
        match self.bits.insert(key.clone(), val) {
            Some(old) if old == val => return,
            Some(_) => {}
            None => self.index(&key, true),
        }
        self.changed.insert(key);
    }
}

impl<O: SourceObject> Deleter<Distribution<O>> for DistributionSection<O> {
    fn delete(&mut self, key: Distribution<O>) {
        if self.bits.remove(&key).is_some() {
            self.index(&key, false);
            self.changed.insert(key);
        }
    }
}

type ModeMap = GenericFactoredMap<ProjectionModeKey, SinglePlacement, GroupResource, ProjectionModeVal>;

fn mode_factorer() -> placement_relations::Factorer<ProjectionModeKey, SinglePlacement, GroupResource> {
    Rotator::new(
        |k: ProjectionModeKey| (k.destination, k.group_resource),
        |(destination, group_resource)| ProjectionModeKey { group_resource, destination },
    )
}

/// API version per (group-resource, destination), indexed by destination.
pub(crate) struct ModeSection {
    modes: ModeMap,
    /// Modes deleted in the current transaction, with their last version.
    retired: FxHashMap<ProjectionModeKey, ProjectionModeVal>,
    changed: FxHashSet<ProjectionModeKey>,
}

impl ModeSection {
    pub(crate) fn new() -> Self {
        Self { modes: ModeMap::new(mode_factorer()), retired: FxHashMap::default(), changed: FxHashSet::default() }
    }

    pub(crate) fn len(&self) -> usize { self.modes.len() }

    pub(crate) fn get(&self, dest: &SinglePlacement, gr: &GroupResource) -> Option<&ProjectionModeVal> {
        self.modes.get_index(dest)?.get(gr)
    }

    pub(crate) fn iter(&self) -> Vec<(ProjectionModeKey, ProjectionModeVal)> {
        let mut out = Vec::with_capacity(self.modes.len());
        self.modes.visit(|k, v| out.push((k, v.clone())));
        out
    }

    pub(crate) fn take_changed(&mut self) -> Vec<ProjectionModeKey> { self.changed.drain().collect() }

    pub(crate) fn take_retired(&mut self) -> FxHashMap<ProjectionModeKey, ProjectionModeVal> {
        std::mem::take(&mut self.retired)
    }
}

impl Putter<ProjectionModeKey, ProjectionModeVal> for ModeSection {
    fn put(&mut self, key: ProjectionModeKey, val: ProjectionModeVal) {
        self.retired.remove(&key);
        if self.modes.put(key.clone(), val).changed() {
            self.changed.insert(key);
        }
    }
}

impl Deleter<ProjectionModeKey> for ModeSection {
    fn delete(&mut self, key: ProjectionModeKey) {
        if let Some(old) = self.modes.delete(key.clone()) {
            self.retired.insert(key.clone(), old);
            self.changed.insert(key);
        }
    }
}

type UpsyncKey = DomainKey<UpsyncSet, UpsyncDomain>;

/// Upsync sets per destination, compared as sets.
pub(crate) struct UpsyncSection {
    rel: SingleIndexedRelation2<SinglePlacement, UpsyncKey>,
    changed: FxHashSet<SinglePlacement>,
}

impl UpsyncSection {
    pub(crate) fn new() -> Self { Self { rel: SingleIndexedRelation2::new(), changed: FxHashSet::default() } }

    pub(crate) fn len(&self) -> usize { Relation::len(&self.rel) }

    pub(crate) fn for_destination(&self, dest: &SinglePlacement) -> Vec<&UpsyncSet> {
        self.rel.get(dest).map(|leaf| leaf.iter().map(|k| &k.value).collect()).unwrap_or_default()
    }

    pub(crate) fn destinations(&self) -> impl Iterator<Item = &SinglePlacement> + '_ { self.rel.parts() }

    pub(crate) fn take_changed(&mut self) -> Vec<SinglePlacement> { self.changed.drain().collect() }
}

impl Adder<(SinglePlacement, UpsyncSet)> for UpsyncSection {
    fn add(&mut self, (dest, u): (SinglePlacement, UpsyncSet)) -> bool {
        let changed = self.rel.add((dest.clone(), DomainKey::new(u)));
        if changed {
            self.changed.insert(dest);
        }
        changed
    }
}

impl Remover<(SinglePlacement, UpsyncSet)> for UpsyncSection {
    fn remove(&mut self, (dest, u): (SinglePlacement, UpsyncSet)) -> bool {
        let changed = self.rel.remove((dest.clone(), DomainKey::new(u)));
        if changed {
            self.changed.insert(dest);
        }
        changed
    }
}
