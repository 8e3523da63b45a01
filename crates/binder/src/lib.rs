//! Placement binder (Milestone 0): joins per-placement what and where into
//! distributions, projection modes and upsyncs.
//!
//! Every upstream notification (a what or where snapshot, or a batch of
//! discovery events) is turned into elemental changes and handed to the
//! [`WorkloadProjector`] in exactly one transaction.

#![forbid(unsafe_code)]

pub mod apimap;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use placement_core::config::EngineConfig;
use placement_core::lockorder::{LockRank, OrderedMutex};
use placement_core::modes::{PropagationMode, ResourceModes};
use placement_core::projection::{WorkloadProjectionSections, WorkloadProjector};
use placement_core::receivers::{
    Adder, ChangeBuffer, Deleter, MapChange, MappingBuffer, Putter, Receiver, Remover, SetChange,
};
use placement_core::runnable::Runnable;
use placement_core::versions;
use placement_core::{
    object_is_system, ClusterName, Distribution, DistributionBits, ExternalName, GroupResource,
    NamespacedDistributionTuple, NamespacedExternalName, NonNamespacedDistributionTuple, ProjectionModeKey,
    ProjectionModeVal, ResolvedWhat, ResolvedWhere, ResourceDetails, SinglePlacement, UpsyncSet,
    WorkloadPartDetails, WorkloadPartID, WorkloadParts,
};
use placement_relations::factorer::Factorer;
use placement_relations::{
    DomainKey, GenericFactoredMap, MapDifferencer, RelayReceiver, Rotator, SingleIndexedRelation3,
    SinglePlacementSliceSetReducer, SliceDifferencer, UpsyncDomain,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use apimap::{
    ApiMapProvider, ClusterApiMap, GroupDetails, GroupReceiver, InMemoryApiMapProvider, ProviderError, ResourceReceiver,
};

/// One change reported by a provider for a cluster the binder watches.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub cluster: ClusterName,
    pub group_resource: GroupResource,
    pub details: Option<ResourceDetails>,
    generation: u64,
}

/// Provider-side subscriber: only enqueues, so it is safe to call with any
/// provider lock held.
struct DiscoveryForwarder {
    cluster: ClusterName,
    generation: u64,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
    wake: Arc<Notify>,
}

impl RelayReceiver<GroupResource, ResourceDetails> for DiscoveryForwarder {
    fn set(&self, key: &GroupResource, val: Option<&ResourceDetails>) {
        let ev = DiscoveryEvent {
            cluster: self.cluster.clone(),
            group_resource: key.clone(),
            details: val.cloned(),
            generation: self.generation,
        };
        if self.tx.send(ev).is_ok() {
            self.wake.notify_one();
        }
    }
}

/// Source cluster, selected object and destination: what one distribution
/// is about, independent of which placements asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DistKey {
    source: ClusterName,
    part: WorkloadPartID,
    dest: SinglePlacement,
}

/// Placement, object, destination.
type BindingKey = (ExternalName, WorkloadPartID, SinglePlacement);

fn binding_factorer() -> Factorer<BindingKey, DistKey, String> {
    Rotator::new(
        |(p, part, dest)| (DistKey { source: p.cluster, part, dest }, p.name),
        |(k, name)| (ExternalName { cluster: k.source, name }, k.part, k.dest),
    )
}

fn mode_key(dk: &DistKey) -> ProjectionModeKey {
    ProjectionModeKey { group_resource: dk.part.group_resource.clone(), destination: dk.dest.clone() }
}

fn namespaced_tuple(dk: &DistKey) -> NamespacedDistributionTuple {
    Distribution {
        key: mode_key(dk),
        object: NamespacedExternalName {
            cluster: dk.source.clone(),
            namespace: dk.part.namespace.clone(),
            name: dk.part.name.clone(),
        },
    }
}

fn cluster_scoped_tuple(dk: &DistKey) -> NonNamespacedDistributionTuple {
    Distribution { key: mode_key(dk), object: ExternalName::new(dk.source.clone(), dk.part.name.clone()) }
}

/// What has been handed to the projector for one [`DistKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct Emitted {
    namespaced: bool,
    bits: DistributionBits,
    version: String,
}

enum Desired {
    Present(Emitted),
    Absent,
    /// Discovery has not described the resource yet.
    Unknown,
}

#[derive(Debug)]
enum ProjectionOp {
    PutNamespaced(NamespacedDistributionTuple, DistributionBits),
    DeleteNamespaced(NamespacedDistributionTuple),
    PutClusterScoped(NonNamespacedDistributionTuple, DistributionBits),
    DeleteClusterScoped(NonNamespacedDistributionTuple),
    PutMode { namespaced: bool, key: ProjectionModeKey, val: ProjectionModeVal },
    DeleteMode { namespaced: bool, key: ProjectionModeKey },
    AddUpsync(SinglePlacement, UpsyncSet),
    RemoveUpsync(SinglePlacement, UpsyncSet),
}

impl ProjectionOp {
    fn put(dk: &DistKey, e: &Emitted) -> Self {
        if e.namespaced {
            Self::PutNamespaced(namespaced_tuple(dk), e.bits)
        } else {
            Self::PutClusterScoped(cluster_scoped_tuple(dk), e.bits)
        }
    }

    fn delete(dk: &DistKey, e: &Emitted) -> Self {
        if e.namespaced {
            Self::DeleteNamespaced(namespaced_tuple(dk))
        } else {
            Self::DeleteClusterScoped(cluster_scoped_tuple(dk))
        }
    }

    fn apply(self, s: &mut dyn WorkloadProjectionSections) {
        match self {
            Self::PutNamespaced(t, b) => s.namespaced_distributions().put(t, b),
            Self::DeleteNamespaced(t) => s.namespaced_distributions().delete(t),
            Self::PutClusterScoped(t, b) => s.non_namespaced_distributions().put(t, b),
            Self::DeleteClusterScoped(t) => s.non_namespaced_distributions().delete(t),
            Self::PutMode { namespaced: true, key, val } => s.namespaced_modes().put(key, val),
            Self::PutMode { namespaced: false, key, val } => s.non_namespaced_modes().put(key, val),
            Self::DeleteMode { namespaced: true, key } => s.namespaced_modes().delete(key),
            Self::DeleteMode { namespaced: false, key } => s.non_namespaced_modes().delete(key),
            Self::AddUpsync(d, u) => {
                s.upsyncs().add((d, u));
            }
            Self::RemoveUpsync(d, u) => {
                s.upsyncs().remove((d, u));
            }
        }
    }
}

/// Changes collected while handling one upstream notification.
#[derive(Default)]
struct Batch {
    ops: Vec<ProjectionOp>,
    touched_modes: FxHashSet<ProjectionModeKey>,
}

struct PerPlacement {
    what: MapDifferencer<WorkloadPartID, WorkloadPartDetails, MappingBuffer<WorkloadPartID, WorkloadPartDetails>>,
    wheres: SinglePlacementSliceSetReducer<ChangeBuffer<SinglePlacement>>,
    upsync: SliceDifferencer<UpsyncSet, UpsyncDomain, ChangeBuffer<UpsyncSet>>,
    has_what: bool,
    has_where: bool,
}

impl PerPlacement {
    fn new() -> Self {
        Self {
            what: MapDifferencer::new(MappingBuffer::default()),
            wheres: SinglePlacementSliceSetReducer::new(ChangeBuffer::default()),
            upsync: SliceDifferencer::new(ChangeBuffer::default()),
            has_what: false,
            has_where: false,
        }
    }
}

/// API versions requested for one (group-resource, destination), with the
/// number of distributions asking for each.
struct ModeVotes {
    namespaced: bool,
    versions: FxHashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct ChosenMode {
    namespaced: bool,
    version: String,
    candidates: usize,
}

struct ClusterSubscription {
    placements: usize,
    generation: u64,
    receiver: ResourceReceiver,
}

struct BinderState {
    placements: FxHashMap<ExternalName, PerPlacement>,
    bindings: GenericFactoredMap<BindingKey, DistKey, String, WorkloadPartDetails>,
    by_resource: SingleIndexedRelation3<ClusterName, GroupResource, DistKey>,
    emitted: FxHashMap<DistKey, Emitted>,
    votes: FxHashMap<ProjectionModeKey, ModeVotes>,
    modes: FxHashMap<ProjectionModeKey, ChosenMode>,
    upsync_refs: FxHashMap<(SinglePlacement, DomainKey<UpsyncSet, UpsyncDomain>), usize>,
    discovery: FxHashMap<ClusterName, FxHashMap<GroupResource, ResourceDetails>>,
    subscriptions: FxHashMap<ClusterName, ClusterSubscription>,
    next_generation: u64,
}

impl BinderState {
    fn new() -> Self {
        Self {
            placements: FxHashMap::default(),
            bindings: GenericFactoredMap::new(binding_factorer()),
            by_resource: SingleIndexedRelation3::new(),
            emitted: FxHashMap::default(),
            votes: FxHashMap::default(),
            modes: FxHashMap::default(),
            upsync_refs: FxHashMap::default(),
            discovery: FxHashMap::default(),
            subscriptions: FxHashMap::default(),
            next_generation: 0,
        }
    }

    fn vote(&mut self, dk: &DistKey, e: &Emitted, batch: &mut Batch) {
        let key = mode_key(dk);
        let v = self
            .votes
            .entry(key.clone())
            .or_insert_with(|| ModeVotes { namespaced: e.namespaced, versions: FxHashMap::default() });
        v.namespaced = e.namespaced;
        *v.versions.entry(e.version.clone()).or_default() += 1;
        batch.touched_modes.insert(key);
    }

    fn unvote(&mut self, dk: &DistKey, e: &Emitted, batch: &mut Batch) {
        let key = mode_key(dk);
        match self.votes.get_mut(&key) {
            Some(v) => {
                if let Some(n) = v.versions.get_mut(&e.version) {
                    *n -= 1;
                    if *n == 0 {
                        v.versions.remove(&e.version);
                    }
                }
                if v.versions.is_empty() {
                    self.votes.remove(&key);
                }
            }
            None => error!(dest = %dk.dest, gr = %dk.part.group_resource, "emitted distribution had no mode vote"),
        }
        batch.touched_modes.insert(key);
    }

    /// Turns changed votes into mode puts and deletes.
    fn settle_modes(&mut self, batch: &mut Batch) {
        let touched: Vec<ProjectionModeKey> = batch.touched_modes.drain().collect();
        for key in touched {
            let want = self.votes.get(&key).and_then(|v| {
                versions::pick(v.versions.keys().map(String::as_str)).map(|ver| ChosenMode {
                    namespaced: v.namespaced,
                    version: ver.to_string(),
                    candidates: v.versions.len(),
                })
            });
            match (self.modes.get(&key), want) {
                (Some(h), Some(w)) if h.namespaced == w.namespaced && h.version == w.version => {}
                (have, Some(w)) => {
                    if let Some(h) = have.filter(|h| h.namespaced != w.namespaced) {
                        batch.ops.push(ProjectionOp::DeleteMode { namespaced: h.namespaced, key: key.clone() });
                    }
                    if w.candidates > 1 {
                        counter!("binder_versions_ambiguous_total", 1u64);
                        info!(
                            dest = %key.destination,
                            gr = %key.group_resource,
                            version = %w.version,
                            candidates = w.candidates,
                            "several api versions requested; picked one"
                        );
                    }
                    batch.ops.push(ProjectionOp::PutMode {
                        namespaced: w.namespaced,
                        key: key.clone(),
                        val: ProjectionModeVal { api_version: w.version.clone() },
                    });
                    self.modes.insert(key, w);
                }
                (Some(h), None) => {
                    batch.ops.push(ProjectionOp::DeleteMode { namespaced: h.namespaced, key: key.clone() });
                    self.modes.remove(&key);
                }
                (None, None) => {}
            }
        }
    }

    fn count_upsync(&mut self, dest: &SinglePlacement, u: &UpsyncSet, add: bool, batch: &mut Batch) {
        let key = (dest.clone(), DomainKey::new(u.clone()));
        if add {
            let n = self.upsync_refs.entry(key).or_insert(0);
            *n += 1;
            if *n == 1 {
                batch.ops.push(ProjectionOp::AddUpsync(dest.clone(), u.clone()));
            }
            return;
        }
        match self.upsync_refs.get_mut(&key) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                // Retract the value that was added, not a merely equivalent one.
                if let Some(((d, added), _)) = self.upsync_refs.remove_entry(&key) {
                    batch.ops.push(ProjectionOp::RemoveUpsync(d, added.into_inner()));
                }
            }
            None => error!(dest = %dest, group = %u.api_group, "upsync released more often than acquired"),
        }
    }
}

struct Settings {
    modes: ResourceModes,
    include_system_objects: bool,
}

enum Update {
    What(Option<ResolvedWhat>),
    Where(Option<ResolvedWhere>),
}

/// Counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinderStats {
    pub placements: usize,
    pub bindings: usize,
    pub distributions: usize,
    pub modes: usize,
    pub upsyncs: usize,
}

/// The binding organizer. One lock guards all of its state, and it is held
/// while the projector transaction runs, so the projector sees changes in
/// the order the binder made them.
pub struct SetBinder {
    state: OrderedMutex<BinderState>,
    settings: Settings,
    provider: Arc<dyn ApiMapProvider>,
    projector: Arc<dyn WorkloadProjector>,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
    /// Leaf lock: only taken to drain, never while calling out.
    inbox: Mutex<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    wake: Arc<Notify>,
}

impl SetBinder {
    pub fn new(
        provider: Arc<dyn ApiMapProvider>,
        projector: Arc<dyn WorkloadProjector>,
        modes: ResourceModes,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: OrderedMutex::new(LockRank::Binder, BinderState::new()),
            settings: Settings { modes, include_system_objects: config.include_system_objects },
            provider,
            projector,
            tx,
            inbox: Mutex::new(rx),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn put_what(&self, placement: ExternalName, what: ResolvedWhat) { self.update(placement, Update::What(Some(what))) }
    pub fn delete_what(&self, placement: ExternalName) { self.update(placement, Update::What(None)) }
    pub fn put_where(&self, placement: ExternalName, wher: ResolvedWhere) { self.update(placement, Update::Where(Some(wher))) }
    pub fn delete_where(&self, placement: ExternalName) { self.update(placement, Update::Where(None)) }

    /// Receiver for the what-resolver's output.
    pub fn what_receiver(self: &Arc<Self>) -> WhatReceiver { WhatReceiver(self.clone()) }

    /// Receiver for the where-resolver's output.
    pub fn where_receiver(self: &Arc<Self>) -> WhereReceiver { WhereReceiver(self.clone()) }

    pub fn stats(&self) -> BinderStats {
        let st = self.state.lock();
        BinderStats {
            placements: st.placements.len(),
            bindings: st.bindings.len(),
            distributions: st.emitted.len(),
            modes: st.modes.len(),
            upsyncs: st.upsync_refs.len(),
        }
    }

    /// Applies queued discovery events in one projector transaction.
    /// Returns how many events were consumed.
    pub fn process_discovery(&self) -> usize {
        let events: Vec<DiscoveryEvent> = {
            let mut rx = self.inbox.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if events.is_empty() {
            return 0;
        }
        let n = events.len();
        let mut st = self.state.lock();
        let mut batch = Batch::default();
        for ev in events {
            self.apply_discovery(&mut st, ev, &mut batch);
        }
        self.commit(&mut st, batch);
        n
    }

    fn update(&self, placement: ExternalName, upd: Update) {
        let mut st = self.state.lock();
        let mut batch = Batch::default();
        self.apply_update(&mut st, placement, upd, &mut batch);
        self.commit(&mut st, batch);
    }

    fn commit(&self, st: &mut BinderState, mut batch: Batch) {
        st.settle_modes(&mut batch);
        if batch.ops.is_empty() {
            return;
        }
        debug!(ops = batch.ops.len(), "binder transaction");
        let mut ops = Some(batch.ops);
        self.projector.transact(&mut |sections| {
            for op in ops.take().into_iter().flatten() {
                op.apply(sections);
            }
        });
    }

    fn apply_update(&self, st: &mut BinderState, name: ExternalName, upd: Update, batch: &mut Batch) {
        if !st.placements.contains_key(&name) {
            if matches!(upd, Update::What(None) | Update::Where(None)) {
                debug!(placement = %name, "delete for unknown placement ignored");
                return;
            }
            st.placements.insert(name.clone(), PerPlacement::new());
            self.subscribe(st, &name.cluster);
        }
        let Some(per) = st.placements.get_mut(&name) else { return };
        match upd {
            Update::What(Some(w)) => {
                per.has_what = true;
                per.what.receive(w.workload_parts);
                per.upsync.receive(w.upsync);
            }
            Update::What(None) => {
                per.has_what = false;
                per.what.receive(Arc::new(WorkloadParts::default()));
                per.upsync.receive(Arc::from(Vec::new()));
            }
            Update::Where(Some(w)) => {
                per.has_where = true;
                per.wheres.receive(w);
            }
            Update::Where(None) => {
                per.has_where = false;
                per.wheres.receive(ResolvedWhere::default());
            }
        }
        let part_changes: Vec<_> = per.what.receiver_mut().drain().collect();
        let upsync_changes: Vec<_> = per.upsync.receiver_mut().drain().collect();
        let dest_changes: Vec<_> = per.wheres.receiver_mut().drain().collect();
        let dests: Vec<SinglePlacement> = per.wheres.destinations().cloned().collect();
        let parts = per.what.current().clone();
        let upsyncs = per.upsync.current().clone();
        let gone = !per.has_what && !per.has_where;

        for change in part_changes {
            match change {
                MapChange::Delete(part) => {
                    for d in &dests {
                        self.bind(st, &name, &part, None, d, batch);
                    }
                }
                MapChange::Put(part, details) => {
                    for d in &dests {
                        self.bind(st, &name, &part, Some(&details), d, batch);
                    }
                }
            }
        }
        for change in upsync_changes {
            let (u, add) = match change {
                SetChange::Add(u) => (u, true),
                SetChange::Remove(u) => (u, false),
            };
            for d in &dests {
                st.count_upsync(d, &u, add, batch);
            }
        }
        for change in dest_changes {
            match change {
                SetChange::Remove(d) => {
                    for part in parts.keys() {
                        self.bind(st, &name, part, None, &d, batch);
                    }
                    for u in upsyncs.iter() {
                        st.count_upsync(&d, u, false, batch);
                    }
                }
                SetChange::Add(d) => {
                    for (part, details) in parts.iter() {
                        self.bind(st, &name, part, Some(details), &d, batch);
                    }
                    for u in upsyncs.iter() {
                        st.count_upsync(&d, u, true, batch);
                    }
                }
            }
        }

        if gone {
            st.placements.remove(&name);
            self.unsubscribe(st, &name.cluster);
        }
    }

    fn bind(
        &self,
        st: &mut BinderState,
        placement: &ExternalName,
        part: &WorkloadPartID,
        details: Option<&WorkloadPartDetails>,
        dest: &SinglePlacement,
        batch: &mut Batch,
    ) {
        let key = (placement.clone(), part.clone(), dest.clone());
        let changed = match details {
            Some(d) => st.bindings.put(key, d.clone()).changed(),
            None => st.bindings.delete(key).is_some(),
        };
        if !changed {
            return;
        }
        let dk = DistKey { source: placement.cluster.clone(), part: part.clone(), dest: dest.clone() };
        let indexed = (dk.source.clone(), dk.part.group_resource.clone(), dk.clone());
        if st.bindings.get_index(&dk).is_some() {
            st.by_resource.add(indexed);
        } else {
            st.by_resource.remove(indexed);
        }
        self.refresh(st, &dk, batch);
    }

    /// Brings what was emitted for `dk` in line with what should be.
    fn refresh(&self, st: &mut BinderState, dk: &DistKey, batch: &mut Batch) {
        match self.desired(st, dk) {
            Desired::Unknown => {
                counter!("binder_deferred_total", 1u64);
                debug!(source = %dk.source, gr = %dk.part.group_resource, dest = %dk.dest, "resource not discovered yet; deferred");
            }
            Desired::Absent => {
                if let Some(old) = st.emitted.remove(dk) {
                    batch.ops.push(ProjectionOp::delete(dk, &old));
                    st.unvote(dk, &old, batch);
                }
            }
            Desired::Present(e) => {
                let old = st.emitted.get(dk).cloned();
                if old.as_ref() == Some(&e) {
                    return;
                }
                if let Some(old) = &old {
                    if old.namespaced != e.namespaced {
                        batch.ops.push(ProjectionOp::delete(dk, old));
                    }
                    st.unvote(dk, old, batch);
                }
                st.vote(dk, &e, batch);
                batch.ops.push(ProjectionOp::put(dk, &e));
                st.emitted.insert(dk.clone(), e);
            }
        }
    }

    fn desired(&self, st: &BinderState, dk: &DistKey) -> Desired {
        let Some(requests) = st.bindings.get_index(dk) else { return Desired::Absent };
        let gr = &dk.part.group_resource;
        match self.settings.modes.get(gr).propagation {
            PropagationMode::Propagate => {}
            PropagationMode::Tolerate => return Desired::Absent,
            PropagationMode::Error => {
                error!(gr = %gr, source = %dk.source, name = %dk.part.name, "resource cannot be propagated; part ignored");
                return Desired::Absent;
            }
        }
        // Name-based only: token secrets are recognised by content when copied.
        if !self.settings.include_system_objects && object_is_system(gr, &dk.part.name, None) {
            return Desired::Absent;
        }
        if dk.part.is_namespace_part() && !requests.values().any(|d| d.include_namespace_object) {
            return Desired::Absent;
        }
        let requested = versions::pick(requests.values().map(|d| d.api_version.as_str()).filter(|v| !v.is_empty()));
        let (namespaced, version) = match st.discovery.get(&dk.source).and_then(|m| m.get(gr)) {
            Some(res) => {
                if !res.supports_informers {
                    debug!(gr = %gr, source = %dk.source, "resource cannot be watched; part ignored");
                    return Desired::Absent;
                }
                let requested = requested.filter(|v| {
                    let served = res.versions.is_empty() || res.versions.iter().any(|s| s == v);
                    if !served {
                        warn!(gr = %gr, source = %dk.source, version = %v, "requested version is not served; using preferred");
                    }
                    served
                });
                let version = requested
                    .map(str::to_string)
                    .or_else(|| (!res.preferred_version.is_empty()).then(|| res.preferred_version.clone()))
                    .or_else(|| versions::pick(res.versions.iter().map(String::as_str)).map(str::to_string));
                let Some(version) = version else {
                    warn!(gr = %gr, source = %dk.source, "discovery lists no version");
                    return Desired::Unknown;
                };
                (res.namespaced, version)
            }
            // Forgotten by discovery: keep what was emitted, still honoring request changes.
            None => match st.emitted.get(dk) {
                Some(e) => (e.namespaced, requested.map_or_else(|| e.version.clone(), str::to_string)),
                None => return Desired::Unknown,
            },
        };
        if namespaced && dk.part.namespace.is_empty() {
            warn!(gr = %gr, name = %dk.part.name, "namespaced resource selected without a namespace; part ignored");
            return Desired::Absent;
        }
        let bits = DistributionBits {
            create_only: requests.values().all(|d| d.create_only),
            return_singleton_state: requests.values().any(|d| d.return_singleton_state),
        };
        Desired::Present(Emitted { namespaced, bits, version })
    }

    fn apply_discovery(&self, st: &mut BinderState, ev: DiscoveryEvent, batch: &mut Batch) {
        let DiscoveryEvent { cluster, group_resource: gr, details, generation } = ev;
        if st.subscriptions.get(&cluster).map(|s| s.generation) != Some(generation) {
            debug!(cluster = %cluster, gr = %gr, "stale discovery event dropped");
            return;
        }
        let table = st.discovery.entry(cluster.clone()).or_default();
        match details {
            Some(d) => {
                if table.get(&gr) == Some(&d) {
                    return;
                }
                table.insert(gr.clone(), d);
            }
            None => {
                if table.remove(&gr).is_none() {
                    return;
                }
                info!(cluster = %cluster, gr = %gr, "resource left discovery; existing distributions kept");
            }
        }
        let keys: Vec<DistKey> = st
            .by_resource
            .get(&cluster)
            .and_then(|r| r.get(&gr))
            .map(|leaf| leaf.iter().cloned().collect())
            .unwrap_or_default();
        for dk in keys {
            self.refresh(st, &dk, batch);
        }
    }

    fn subscribe(&self, st: &mut BinderState, cluster: &str) {
        if let Some(sub) = st.subscriptions.get_mut(cluster) {
            sub.placements += 1;
            return;
        }
        st.next_generation += 1;
        let generation = st.next_generation;
        let receiver: ResourceReceiver = Arc::new(DiscoveryForwarder {
            cluster: cluster.to_string(),
            generation,
            tx: self.tx.clone(),
            wake: self.wake.clone(),
        });
        if let Err(e) = self.provider.add_receivers(cluster, None, Some(receiver.clone())) {
            error!(cluster, error = %e, "api discovery unavailable; distributions from this cluster stay deferred");
        }
        st.subscriptions.insert(cluster.to_string(), ClusterSubscription { placements: 1, generation, receiver });
    }

    fn unsubscribe(&self, st: &mut BinderState, cluster: &str) {
        let Some(sub) = st.subscriptions.get_mut(cluster) else { return };
        sub.placements -= 1;
        if sub.placements > 0 {
            return;
        }
        if let Some(sub) = st.subscriptions.remove(cluster) {
            self.provider.remove_receivers(cluster, None, Some(&sub.receiver));
        }
        st.discovery.remove(cluster);
    }
}

#[async_trait]
impl Runnable for SetBinder {
    fn name(&self) -> &str { "set-binder" }

    async fn run(self: Arc<Self>, ctx: CancellationToken) {
        info!("binder started");
        loop {
            let n = self.process_discovery();
            if n > 0 {
                debug!(events = n, "discovery applied");
            }
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        info!("binder stopped");
    }
}

/// Feeds what-resolutions into a [`SetBinder`].
#[derive(Clone)]
pub struct WhatReceiver(Arc<SetBinder>);

impl Putter<ExternalName, ResolvedWhat> for WhatReceiver {
    fn put(&mut self, key: ExternalName, val: ResolvedWhat) { self.0.put_what(key, val) }
}

impl Deleter<ExternalName> for WhatReceiver {
    fn delete(&mut self, key: ExternalName) { self.0.delete_what(key) }
}

/// Feeds where-resolutions into a [`SetBinder`].
#[derive(Clone)]
pub struct WhereReceiver(Arc<SetBinder>);

impl Putter<ExternalName, ResolvedWhere> for WhereReceiver {
    fn put(&mut self, key: ExternalName, val: ResolvedWhere) { self.0.put_where(key, val) }
}

impl Deleter<ExternalName> for WhereReceiver {
    fn delete(&mut self, key: ExternalName) { self.0.delete_where(key) }
}
