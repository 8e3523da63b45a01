//! Per-cluster API discovery as a subscription.
//!
//! A provider keeps, for every cluster it knows about, the latest group and
//! resource information in a pair of [`RelayMap`]s. Subscribers are never
//! invoked synchronously from `add_receivers`: the initial replay is parked
//! and delivered by [`InMemoryApiMapProvider::deliver_pending`].

use std::sync::Arc;

use async_trait::async_trait;
use placement_core::lockorder::{LockRank, OrderedMutex};
use placement_core::runnable::Runnable;
use placement_core::{ClusterName, GroupResource, ResourceDetails};
use placement_relations::{RelayMap, RelayReceiver};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What discovery says about one API group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupDetails {
    pub preferred_version: String,
    pub versions: SmallVec<[String; 2]>,
}

pub type GroupReceiver = Arc<dyn RelayReceiver<String, GroupDetails>>;
pub type ResourceReceiver = Arc<dyn RelayReceiver<GroupResource, ResourceDetails>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("cluster {0} is not served by this provider")]
    UnknownCluster(ClusterName),
}

/// Source of per-cluster discovery information.
pub trait ApiMapProvider: Send + Sync {
    fn add_receivers(
        &self,
        cluster: &str,
        groups: Option<GroupReceiver>,
        resources: Option<ResourceReceiver>,
    ) -> Result<(), ProviderError>;

    /// Returns whether anything was registered.
    fn remove_receivers(&self, cluster: &str, groups: Option<&GroupReceiver>, resources: Option<&ResourceReceiver>) -> bool;
}

/// The two relays of one cluster.
pub struct ClusterApiMap {
    pub groups: RelayMap<String, GroupDetails>,
    pub resources: RelayMap<GroupResource, ResourceDetails>,
}

impl Default for ClusterApiMap {
    fn default() -> Self { Self { groups: RelayMap::new(true), resources: RelayMap::new(true) } }
}

enum Pending {
    Groups(Arc<ClusterApiMap>, GroupReceiver),
    Resources(Arc<ClusterApiMap>, ResourceReceiver),
}

#[derive(Default)]
struct Registry {
    clusters: FxHashMap<ClusterName, Arc<ClusterApiMap>>,
    pending: Vec<Pending>,
}

/// Provider fed by whoever owns it: tests, a static catalog, or a
/// discovery poller.
pub struct InMemoryApiMapProvider {
    registry: OrderedMutex<Registry>,
    /// When false, `add_receivers` rejects clusters never seen by `set_*`.
    open: bool,
    wake: Notify,
}

impl Default for InMemoryApiMapProvider {
    fn default() -> Self { Self::new(true) }
}

impl InMemoryApiMapProvider {
    pub fn new(open: bool) -> Self {
        Self { registry: OrderedMutex::with_default(LockRank::ApiMapProvider), open, wake: Notify::new() }
    }

    /// The relays of `cluster`, created on first use.
    pub fn cluster(&self, cluster: &str) -> Arc<ClusterApiMap> {
        let mut reg = self.registry.lock();
        reg.clusters.entry(cluster.to_string()).or_default().clone()
    }

    pub fn clusters(&self) -> Vec<ClusterName> { self.registry.lock().clusters.keys().cloned().collect() }

    pub fn set_resource(&self, cluster: &str, gr: GroupResource, details: ResourceDetails) {
        self.cluster(cluster).resources.set(gr, details);
    }

    pub fn remove_resource(&self, cluster: &str, gr: &GroupResource) -> bool {
        let Some(m) = self.registry.lock().clusters.get(cluster).cloned() else { return false };
        m.resources.remove(gr)
    }

    pub fn set_group(&self, cluster: &str, group: String, details: GroupDetails) {
        self.cluster(cluster).groups.set(group, details);
    }

    /// Replays current contents to receivers registered since the last call.
    /// Returns how many registrations were completed.
    pub fn deliver_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.registry.lock().pending);
        let n = pending.len();
        for p in pending {
            match p {
                Pending::Groups(m, r) => {
                    m.groups.add_receiver(r, true);
                }
                Pending::Resources(m, r) => {
                    m.resources.add_receiver(r, true);
                }
            }
        }
        if n > 0 {
            debug!(registrations = n, "api map receivers attached");
        }
        n
    }
}

impl ApiMapProvider for InMemoryApiMapProvider {
    fn add_receivers(
        &self,
        cluster: &str,
        groups: Option<GroupReceiver>,
        resources: Option<ResourceReceiver>,
    ) -> Result<(), ProviderError> {
        {
            let mut reg = self.registry.lock();
            let map = match reg.clusters.get(cluster) {
                Some(m) => m.clone(),
                None if self.open => reg.clusters.entry(cluster.to_string()).or_default().clone(),
                None => return Err(ProviderError::UnknownCluster(cluster.to_string())),
            };
            if let Some(g) = groups {
                reg.pending.push(Pending::Groups(map.clone(), g));
            }
            if let Some(r) = resources {
                reg.pending.push(Pending::Resources(map, r));
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    fn remove_receivers(&self, cluster: &str, groups: Option<&GroupReceiver>, resources: Option<&ResourceReceiver>) -> bool {
        let map = {
            let mut reg = self.registry.lock();
            let before = reg.pending.len();
            reg.pending.retain(|p| match p {
                Pending::Groups(_, g) => !groups.is_some_and(|x| Arc::ptr_eq(x, g)),
                Pending::Resources(_, r) => !resources.is_some_and(|x| Arc::ptr_eq(x, r)),
            });
            if reg.pending.len() != before {
                return true;
            }
            reg.clusters.get(cluster).cloned()
        };
        let Some(map) = map else { return false };
        let mut removed = false;
        if let Some(g) = groups {
            removed |= map.groups.remove_receiver(g);
        }
        if let Some(r) = resources {
            removed |= map.resources.remove_receiver(r);
        }
        removed
    }
}

#[async_trait]
impl Runnable for InMemoryApiMapProvider {
    fn name(&self) -> &str { "api-map-provider" }

    async fn run(self: Arc<Self>, ctx: CancellationToken) {
        info!("api map provider started");
        loop {
            self.deliver_pending();
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        info!("api map provider stopped");
    }
}
