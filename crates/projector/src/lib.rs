//! Placement projector (Milestone 0): holds the distribution plan, turns
//! every transaction into per-destination sync configurations and
//! per-object work, and drains that work through a [`Materializer`].

#![forbid(unsafe_code)]

pub mod materialize;
pub mod queue;
mod sections;
pub mod syncfg;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use placement_core::config::EngineConfig;
use placement_core::lockorder::{LockRank, OrderedGuard, OrderedMutex};
use placement_core::projection::{WorkloadProjectionSections, WorkloadProjector};
use placement_core::receivers::{MappingReceiver, SetChangeReceiver};
use placement_core::runnable::Runnable;
use placement_core::versions;
use placement_core::{
    ClusterName, Distribution, DistributionBits, ExternalName, GroupResource, NamespacedDistributionTuple,
    NamespacedExternalName, NamespacedName, NonNamespacedDistributionTuple, ProjectionModeKey, ProjectionModeVal,
    SinglePlacement, UpsyncSet,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use materialize::{
    object_channel, Applied, MaterializeError, Materializer, NullWatcher, ObjectEvents, ObjectNotifier, ObjectRef,
    RecordingMaterializer, SourceObjectEvent, SourceWatcher,
};
pub use queue::WorkQueue;
pub use syncfg::{SyncerConfigSpec, FIELD_MANAGER, SYNCER_CONFIG_NAME};

use sections::{DistributionSection, ModeSection, UpsyncSection};
use syncfg::{GroupVersionResource, SpecBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    /// Bring the destination's sync configuration up to date.
    SyncConfig(SinglePlacement),
    /// Bring one destination copy in line with the plan.
    Object(ObjectRef),
}

#[derive(Default)]
struct PerDestination {
    last_applied: Option<Arc<SyncerConfigSpec>>,
}

enum Decision {
    Upsert { api_version: String, bits: DistributionBits },
    Delete { api_version: Option<String>, stamp: Option<u64> },
    Broken(String),
}

/// Version a removed copy was written at, kept until its delete settles.
struct PendingDelete {
    api_version: String,
    stamp: u64,
}

fn gvr(gr: &GroupResource, version: &str) -> GroupVersionResource {
    GroupVersionResource { group: gr.group.clone(), version: version.to_string(), resource: gr.resource.clone() }
}

struct ProjectorState {
    namespaced: DistributionSection<NamespacedExternalName>,
    cluster_scoped: DistributionSection<ExternalName>,
    namespaced_modes: ModeSection,
    cluster_modes: ModeSection,
    upsyncs: UpsyncSection,
    destinations: FxHashMap<SinglePlacement, PerDestination>,
    /// Version each (source, group-resource) is watched at.
    watches: FxHashMap<(ClusterName, GroupResource), String>,
    pending_deletes: FxHashMap<ObjectRef, PendingDelete>,
    next_stamp: u64,
}

impl ProjectorState {
    fn new() -> Self {
        Self {
            namespaced: DistributionSection::new(),
            cluster_scoped: DistributionSection::new(),
            namespaced_modes: ModeSection::new(),
            cluster_modes: ModeSection::new(),
            upsyncs: UpsyncSection::new(),
            destinations: FxHashMap::default(),
            watches: FxHashMap::default(),
            pending_deletes: FxHashMap::default(),
            next_stamp: 0,
        }
    }

    fn desired_spec(&self, dest: &SinglePlacement) -> SyncerConfigSpec {
        let mut b = SpecBuilder::default();
        self.namespaced.for_destination(dest, |gr, obj| match self.namespaced_modes.get(dest, gr) {
            Some(m) => b.namespaced(gvr(gr, &m.api_version), &obj.namespace, &obj.name),
            None => error!(dest = %dest, gr = %gr, "namespaced distribution without a mode"),
        });
        self.cluster_scoped.for_destination(dest, |gr, name| match self.cluster_modes.get(dest, gr) {
            Some(m) => b.cluster_scoped(gvr(gr, &m.api_version), name),
            None => error!(dest = %dest, gr = %gr, "cluster-scoped distribution without a mode"),
        });
        for u in self.upsyncs.for_destination(dest) {
            b.upsync(u);
        }
        b.build()
    }

    fn in_step(&self, dest: &SinglePlacement, desired: &SyncerConfigSpec) -> bool {
        match self.destinations.get(dest).and_then(|p| p.last_applied.as_ref()) {
            Some(last) => **last == *desired,
            None => desired.is_empty(),
        }
    }

    fn object_decision(&self, obj: &ObjectRef) -> Decision {
        let key = ProjectionModeKey { group_resource: obj.group_resource.clone(), destination: obj.dest.clone() };
        let (bits, modes) = if obj.is_namespaced() {
            let t = Distribution {
                key,
                object: NamespacedExternalName {
                    cluster: obj.source.clone(),
                    namespace: obj.namespace.clone(),
                    name: obj.name.clone(),
                },
            };
            (self.namespaced.get(&t), &self.namespaced_modes)
        } else {
            let t = Distribution { key, object: ExternalName::new(obj.source.clone(), obj.name.clone()) };
            (self.cluster_scoped.get(&t), &self.cluster_modes)
        };
        match bits {
            Some(bits) => match modes.get(&obj.dest, &obj.group_resource) {
                Some(m) => Decision::Upsert { api_version: m.api_version.clone(), bits },
                None => Decision::Broken(format!("no api version for {} at {}", obj.group_resource, obj.dest)),
            },
            None => match self.pending_deletes.get(obj) {
                Some(p) => Decision::Delete { api_version: Some(p.api_version.clone()), stamp: Some(p.stamp) },
                None => Decision::Delete {
                    api_version: modes.get(&obj.dest, &obj.group_resource).map(|m| m.api_version.clone()),
                    stamp: None,
                },
            },
        }
    }

    /// Records or clears the version needed to delete the copy `obj`
    /// after its distribution changed. `retired` holds the modes deleted
    /// in the same transaction.
    fn track_removal(
        &mut self,
        obj: &ObjectRef,
        live: bool,
        retired: &FxHashMap<ProjectionModeKey, ProjectionModeVal>,
    ) {
        if live {
            self.pending_deletes.remove(obj);
            return;
        }
        let modes = if obj.is_namespaced() { &self.namespaced_modes } else { &self.cluster_modes };
        let key = ProjectionModeKey { group_resource: obj.group_resource.clone(), destination: obj.dest.clone() };
        let version = modes
            .get(&obj.dest, &obj.group_resource)
            .or_else(|| retired.get(&key))
            .map(|m| m.api_version.clone())
            .or_else(|| self.pending_deletes.get(obj).map(|p| p.api_version.clone()));
        match version {
            Some(api_version) => {
                self.next_stamp += 1;
                let stamp = self.next_stamp;
                self.pending_deletes.insert(obj.clone(), PendingDelete { api_version, stamp });
            }
            None => {
                warn!(dest = %obj.dest, gr = %obj.group_resource, name = %obj.name, "removed copy has no known version");
            }
        }
    }

    /// Forgets the version of a settled delete unless a later removal
    /// replaced it.
    fn settle_delete(&mut self, obj: &ObjectRef, stamp: Option<u64>) {
        if stamp.is_some() && self.pending_deletes.get(obj).map(|p| p.stamp) == stamp {
            self.pending_deletes.remove(obj);
        }
    }

    /// Best version among the destinations `cluster` sends `gr` to; `None`
    /// when nothing of `gr` leaves `cluster`.
    fn watch_version(&self, cluster: &ClusterName, gr: &GroupResource) -> Option<String> {
        let mut dests = self.namespaced.destinations_of_source(cluster, gr);
        dests.extend(self.cluster_scoped.destinations_of_source(cluster, gr));
        let candidates: Vec<&str> = dests
            .iter()
            .filter_map(|d| self.namespaced_modes.get(d, gr).or_else(|| self.cluster_modes.get(d, gr)))
            .map(|m| m.api_version.as_str())
            .collect();
        versions::pick(candidates).map(str::to_string)
    }

    fn all_destinations(&self) -> BTreeSet<SinglePlacement> {
        self.namespaced
            .destinations()
            .chain(self.cluster_scoped.destinations())
            .chain(self.upsyncs.destinations())
            .cloned()
            .collect()
    }
}

/// Holds the lock for the duration of one transaction; publishing happens
/// when it is dropped, also when the caller's closure panics.
struct Transaction<'a> {
    projector: &'a Projector,
    state: OrderedGuard<'a, ProjectorState>,
}

impl WorkloadProjectionSections for Transaction<'_> {
    fn namespaced_distributions(&mut self) -> &mut dyn MappingReceiver<NamespacedDistributionTuple, DistributionBits> {
        &mut self.state.namespaced
    }

    fn namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal> {
        &mut self.state.namespaced_modes
    }

    fn non_namespaced_distributions(
        &mut self,
    ) -> &mut dyn MappingReceiver<NonNamespacedDistributionTuple, DistributionBits> {
        &mut self.state.cluster_scoped
    }

    fn non_namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal> {
        &mut self.state.cluster_modes
    }

    fn upsyncs(&mut self) -> &mut dyn SetChangeReceiver<(SinglePlacement, UpsyncSet)> { &mut self.state.upsyncs }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) { self.projector.flush(&mut self.state); }
}

/// Counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProjectorStats {
    pub namespaced_distributions: usize,
    pub cluster_scoped_distributions: usize,
    pub modes: usize,
    pub upsyncs: usize,
    pub watches: usize,
    /// Removed copies whose delete has not settled yet.
    pub pending_deletes: usize,
    pub queued: usize,
}

pub struct Projector {
    state: OrderedMutex<ProjectorState>,
    queue: Arc<WorkQueue<WorkItem>>,
    materializer: Arc<dyn Materializer>,
    watcher: Arc<dyn SourceWatcher>,
    config: EngineConfig,
    /// Taken once by `run`.
    events: Mutex<Option<ObjectEvents>>,
}

impl Projector {
    pub fn new(
        config: &EngineConfig,
        materializer: Arc<dyn Materializer>,
        watcher: Arc<dyn SourceWatcher>,
        events: ObjectEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: OrderedMutex::new(LockRank::WorkloadProjector, ProjectorState::new()),
            queue: Arc::new(WorkQueue::new(config)),
            materializer,
            watcher,
            config: config.clone(),
            events: Mutex::new(Some(events)),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkItem>> { &self.queue }

    pub fn stats(&self) -> ProjectorStats {
        let st = self.state.lock();
        ProjectorStats {
            namespaced_distributions: st.namespaced.len(),
            cluster_scoped_distributions: st.cluster_scoped.len(),
            modes: st.namespaced_modes.len() + st.cluster_modes.len(),
            upsyncs: st.upsyncs.len(),
            watches: st.watches.len(),
            pending_deletes: st.pending_deletes.len(),
            queued: self.queue.len(),
        }
    }

    /// Desired sync configuration of every destination with something to sync.
    pub fn syncer_configs(&self) -> BTreeMap<SinglePlacement, SyncerConfigSpec> {
        let st = self.state.lock();
        st.all_destinations()
            .into_iter()
            .map(|d| {
                let spec = st.desired_spec(&d);
                (d, spec)
            })
            .collect()
    }

    pub fn namespaced_distributions(&self) -> Vec<(NamespacedDistributionTuple, DistributionBits)> {
        let st = self.state.lock();
        let mut out: Vec<_> = st.namespaced.iter().map(|(t, b)| (t.clone(), *b)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn cluster_scoped_distributions(&self) -> Vec<(NonNamespacedDistributionTuple, DistributionBits)> {
        let st = self.state.lock();
        let mut out: Vec<_> = st.cluster_scoped.iter().map(|(t, b)| (t.clone(), *b)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn modes(&self) -> Vec<(ProjectionModeKey, ProjectionModeVal)> {
        let st = self.state.lock();
        let mut out = st.namespaced_modes.iter();
        out.extend(st.cluster_modes.iter());
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Current source watches as (source, group-resource, version).
    pub fn watches(&self) -> Vec<(ClusterName, GroupResource, String)> {
        let st = self.state.lock();
        let mut out: Vec<_> = st.watches.iter().map(|((c, gr), v)| (c.clone(), gr.clone(), v.clone())).collect();
        out.sort();
        out
    }

    /// Cross-index agreement and mode coverage; returns every violation found.
    pub fn verify(&self) -> Vec<String> {
        let st = self.state.lock();
        let mut problems = Vec::new();
        let sections = [("namespaced", st.namespaced.index_lens()), ("cluster-scoped", st.cluster_scoped.index_lens())];
        for (name, (a, b, c)) in sections {
            if a != b || a != c {
                problems.push(format!("{name}: {a} tuples, {b} by source, {c} by destination"));
            }
        }
        for (t, _) in st.namespaced.iter() {
            if st.namespaced_modes.get(&t.key.destination, &t.key.group_resource).is_none() {
                problems.push(format!("no mode for {} at {}", t.key.group_resource, t.key.destination));
            }
        }
        for (t, _) in st.cluster_scoped.iter() {
            if st.cluster_modes.get(&t.key.destination, &t.key.group_resource).is_none() {
                problems.push(format!("no mode for {} at {}", t.key.group_resource, t.key.destination));
            }
        }
        problems
    }

    /// Queues every destination copy of a source object whose content changed.
    pub fn object_changed(&self, ev: &SourceObjectEvent) {
        let st = self.state.lock();
        let dests = if ev.namespace.is_empty() {
            st.cluster_scoped.destinations_of(&ev.source, &ev.group_resource, &ev.name)
        } else {
            let local = NamespacedName { namespace: ev.namespace.clone(), name: ev.name.clone() };
            st.namespaced.destinations_of(&ev.source, &ev.group_resource, &local)
        };
        for dest in dests {
            self.queue.add(WorkItem::Object(ObjectRef {
                source: ev.source.clone(),
                group_resource: ev.group_resource.clone(),
                namespace: ev.namespace.clone(),
                name: ev.name.clone(),
                dest,
            }));
        }
    }

    /// Processes queued items without waiting for new ones. Returns how many
    /// were handled; items put back for a retry come back after their backoff.
    pub async fn drain(&self) -> usize {
        let mut n = 0;
        while let Some(item) = self.queue.try_get() {
            self.process(item).await;
            n += 1;
        }
        n
    }

    fn flush(&self, st: &mut ProjectorState) {
        let namespaced = st.namespaced.take_changed();
        let cluster_scoped = st.cluster_scoped.take_changed();
        let namespaced_modes = st.namespaced_modes.take_changed();
        let cluster_modes = st.cluster_modes.take_changed();
        let namespaced_retired = st.namespaced_modes.take_retired();
        let cluster_retired = st.cluster_modes.take_retired();
        let upsyncs = st.upsyncs.take_changed();

        let mut dests: BTreeSet<SinglePlacement> = upsyncs.into_iter().collect();
        let mut sources: BTreeSet<(ClusterName, GroupResource)> = BTreeSet::new();
        let mut objects: BTreeSet<ObjectRef> = BTreeSet::new();

        for t in namespaced {
            let live = st.namespaced.get(&t).is_some();
            let Distribution { key, object } = t;
            dests.insert(key.destination.clone());
            sources.insert((object.cluster.clone(), key.group_resource.clone()));
            let obj = ObjectRef {
                source: object.cluster,
                group_resource: key.group_resource,
                namespace: object.namespace,
                name: object.name,
                dest: key.destination,
            };
            st.track_removal(&obj, live, &namespaced_retired);
            objects.insert(obj);
        }
        for t in cluster_scoped {
            let live = st.cluster_scoped.get(&t).is_some();
            let Distribution { key, object } = t;
            dests.insert(key.destination.clone());
            sources.insert((object.cluster.clone(), key.group_resource.clone()));
            let obj = ObjectRef {
                source: object.cluster,
                group_resource: key.group_resource,
                namespace: String::new(),
                name: object.name,
                dest: key.destination,
            };
            st.track_removal(&obj, live, &cluster_retired);
            objects.insert(obj);
        }
        // A new version means every copy at that destination is rewritten.
        for key in namespaced_modes {
            for (obj, cluster) in st.namespaced.at(&key.destination, &key.group_resource) {
                sources.insert((cluster.clone(), key.group_resource.clone()));
                objects.insert(ObjectRef {
                    source: cluster,
                    group_resource: key.group_resource.clone(),
                    namespace: obj.namespace,
                    name: obj.name,
                    dest: key.destination.clone(),
                });
            }
            dests.insert(key.destination);
        }
        for key in cluster_modes {
            for (name, cluster) in st.cluster_scoped.at(&key.destination, &key.group_resource) {
                sources.insert((cluster.clone(), key.group_resource.clone()));
                objects.insert(ObjectRef {
                    source: cluster,
                    group_resource: key.group_resource.clone(),
                    namespace: String::new(),
                    name,
                    dest: key.destination.clone(),
                });
            }
            dests.insert(key.destination);
        }

        for (cluster, gr) in &sources {
            self.sync_watch(st, cluster, gr);
        }
        let mut configs = 0usize;
        for dest in dests {
            let desired = st.desired_spec(&dest);
            if st.in_step(&dest, &desired) {
                if desired.is_empty() {
                    st.destinations.remove(&dest);
                }
                continue;
            }
            configs += 1;
            self.queue.add(WorkItem::SyncConfig(dest));
        }
        let n_objects = objects.len();
        for o in objects {
            self.queue.add(WorkItem::Object(o));
        }
        if configs + n_objects > 0 {
            debug!(configs, objects = n_objects, sources = sources.len(), "projector flush");
        }
    }

    fn sync_watch(&self, st: &mut ProjectorState, cluster: &ClusterName, gr: &GroupResource) {
        let key = (cluster.clone(), gr.clone());
        let have = st.watches.get(&key).cloned();
        match (have, st.watch_version(cluster, gr)) {
            (Some(have), Some(want)) if have == want => {}
            (_, Some(want)) => {
                debug!(source = %cluster, gr = %gr, version = %want, "watching source");
                self.watcher.watch(cluster, gr, &want);
                st.watches.insert(key, want);
            }
            (Some(_), None) => {
                debug!(source = %cluster, gr = %gr, "unwatching source");
                self.watcher.unwatch(cluster, gr);
                st.watches.remove(&key);
            }
            (None, None) => {}
        }
    }

    async fn handle(&self, item: &WorkItem) -> Result<(), MaterializeError> {
        match item {
            WorkItem::SyncConfig(dest) => {
                let spec = {
                    let st = self.state.lock();
                    let spec = st.desired_spec(dest);
                    if st.in_step(dest, &spec) {
                        return Ok(());
                    }
                    spec
                };
                self.materializer.apply_sync_config(dest, &spec).await?;
                let mut st = self.state.lock();
                if spec.is_empty() {
                    st.destinations.remove(dest);
                } else {
                    st.destinations.entry(dest.clone()).or_default().last_applied = Some(Arc::new(spec));
                }
                // Transactions during the apply compared against the old
                // state; the queue holds it dirty until `done`.
                let now = st.desired_spec(dest);
                if !st.in_step(dest, &now) {
                    debug!(dest = %dest, "sync configuration moved during apply");
                    self.queue.add(item.clone());
                }
                Ok(())
            }
            WorkItem::Object(obj) => {
                let decision = self.state.lock().object_decision(obj);
                match decision {
                    Decision::Upsert { api_version, bits } => {
                        self.materializer.upsert_object(obj, &api_version, bits).await
                    }
                    Decision::Delete { api_version, stamp } => {
                        let r = self.materializer.delete_object(obj, api_version.as_deref()).await;
                        if !matches!(&r, Err(e) if e.is_retryable()) {
                            self.state.lock().settle_delete(obj, stamp);
                        }
                        r
                    }
                    Decision::Broken(msg) => Err(MaterializeError::Permanent(msg)),
                }
            }
        }
    }

    async fn process(&self, item: WorkItem) {
        if !self.config.throttle.is_zero() {
            tokio::time::sleep(self.config.throttle).await;
        }
        match self.handle(&item).await {
            Ok(()) => self.queue.forget(&item),
            Err(e) if e.is_retryable() => {
                counter!("projector_items_retried_total", 1u64);
                warn!(?item, error = %e, retries = self.queue.num_requeues(&item), "retrying");
                self.queue.add_rate_limited(item.clone());
            }
            Err(e) => {
                counter!("projector_items_dropped_total", 1u64);
                error!(?item, error = %e, "giving up on item");
                self.queue.forget(&item);
            }
        }
        self.queue.done(&item);
    }
}

impl WorkloadProjector for Projector {
    fn transact(&self, f: &mut dyn FnMut(&mut dyn WorkloadProjectionSections)) {
        let started = Instant::now();
        {
            let mut txn = Transaction { projector: self, state: self.state.lock() };
            f(&mut txn);
        }
        counter!("projector_transactions_total", 1u64);
        histogram!("projector_transact_ms", started.elapsed().as_secs_f64() * 1000.0);
    }
}

#[async_trait]
impl Runnable for Projector {
    fn name(&self) -> &str { "workload-projector" }

    async fn run(self: Arc<Self>, ctx: CancellationToken) {
        let n = self.config.workers.max(1);
        info!(workers = n, "projector started");
        let workers: Vec<_> = (0..n)
            .map(|id| {
                let me = self.clone();
                tokio::spawn(async move {
                    while let Some(item) = me.queue.get().await {
                        me.process(item).await;
                    }
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();
        let events = self.events.lock().take();
        match events {
            Some(mut rx) => loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => self.object_changed(&ev),
                        None => {
                            ctx.cancelled().await;
                            break;
                        }
                    },
                }
            },
            None => ctx.cancelled().await,
        }
        self.queue.shut_down();
        for r in futures::future::join_all(workers).await {
            if let Err(e) = r {
                error!(error = %e, "projector worker failed");
            }
        }
        info!("projector stopped");
    }
}
