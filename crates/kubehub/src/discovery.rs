//! API-map provider fed by periodic kube discovery of every known cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::core::ApiResource;
use kube::discovery::{verbs, ApiCapabilities, Discovery, Scope};
use metrics::{counter, histogram};
use placement_binder::{
    ApiMapProvider, ClusterApiMap, GroupDetails, GroupReceiver, InMemoryApiMapProvider, ProviderError,
    ResourceReceiver,
};
use placement_core::runnable::Runnable;
use placement_core::{GroupResource, ResourceDetails};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClusterClients;

/// Merges one discovered (resource, version) into `into`. Versions are
/// kept in discovery order; `preferred` wins when it serves the resource.
pub fn fold_resource(
    into: &mut BTreeMap<GroupResource, ResourceDetails>,
    ar: &ApiResource,
    caps: &ApiCapabilities,
    preferred: &str,
) {
    if ar.plural.contains('/') {
        return;
    }
    let gr = GroupResource::new(ar.group.clone(), ar.plural.clone());
    let informable = caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH);
    let d = into.entry(gr).or_insert_with(|| ResourceDetails {
        namespaced: matches!(caps.scope, Scope::Namespaced),
        supports_informers: informable,
        preferred_version: String::new(),
        versions: Default::default(),
    });
    d.supports_informers &= informable;
    if !d.versions.iter().any(|v| *v == ar.version) {
        d.versions.push(ar.version.clone());
    }
    if ar.version == preferred || d.preferred_version.is_empty() {
        d.preferred_version = ar.version.clone();
    }
}

/// Brings `map` in line with one discovery round. Unchanged entries are
/// not republished. Returns (resources changed, resources removed).
pub(crate) fn publish(
    map: &ClusterApiMap,
    groups: BTreeMap<String, GroupDetails>,
    resources: BTreeMap<GroupResource, ResourceDetails>,
) -> (usize, usize) {
    for g in map.groups.keys() {
        if !groups.contains_key(&g) {
            map.groups.remove(&g);
        }
    }
    for (g, details) in groups {
        map.groups.update(g, details);
    }
    let mut removed = 0usize;
    for gr in map.resources.keys() {
        if !resources.contains_key(&gr) && map.resources.remove(&gr) {
            removed += 1;
        }
    }
    let mut changed = 0usize;
    for (gr, details) in resources {
        if map.resources.update(gr, details) {
            changed += 1;
        }
    }
    (changed, removed)
}

pub struct KubeApiMapProvider {
    inner: Arc<InMemoryApiMapProvider>,
    clients: Arc<ClusterClients>,
    interval: Duration,
}

impl KubeApiMapProvider {
    /// Only clusters with a client are served; others are rejected.
    pub fn new(clients: Arc<ClusterClients>, interval: Duration) -> Self {
        let inner = Arc::new(InMemoryApiMapProvider::new(false));
        for name in clients.names() {
            inner.cluster(&name);
        }
        Self { inner, clients, interval }
    }

    /// Runs discovery against `cluster` and publishes any differences.
    /// Returns the number of resources served.
    pub async fn refresh(&self, cluster: &str) -> Result<usize> {
        let client = self.clients.get(cluster).with_context(|| format!("no client for {cluster}"))?.clone();
        let t0 = Instant::now();
        let discovery = Discovery::new(client).run().await.with_context(|| format!("discovery of {cluster}"))?;
        let mut resources = BTreeMap::new();
        let mut groups = BTreeMap::new();
        for group in discovery.groups() {
            let preferred = group.preferred_version_or_latest().to_string();
            let versions: Vec<String> = group.versions().map(str::to_string).collect();
            for v in &versions {
                for (ar, caps) in group.versioned_resources(v) {
                    fold_resource(&mut resources, &ar, &caps, &preferred);
                }
            }
            groups.insert(
                group.name().to_string(),
                GroupDetails { preferred_version: preferred, versions: versions.into_iter().collect() },
            );
        }
        let n = resources.len();
        let (changed, removed) = publish(&self.inner.cluster(cluster), groups, resources);
        histogram!("kubehub_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kubehub_discovery_runs_total", 1u64);
        debug!(cluster, resources = n, changed, removed, "discovery refreshed");
        Ok(n)
    }

    async fn refresh_all(&self) {
        for cluster in self.clients.names() {
            if let Err(e) = self.refresh(&cluster).await {
                counter!("kubehub_discovery_errors_total", 1u64);
                warn!(cluster = %cluster, error = %e, "discovery failed");
            }
        }
    }
}

impl ApiMapProvider for KubeApiMapProvider {
    fn add_receivers(
        &self,
        cluster: &str,
        groups: Option<GroupReceiver>,
        resources: Option<ResourceReceiver>,
    ) -> Result<(), ProviderError> {
        self.inner.add_receivers(cluster, groups, resources)
    }

    fn remove_receivers(&self, cluster: &str, groups: Option<&GroupReceiver>, resources: Option<&ResourceReceiver>) -> bool {
        self.inner.remove_receivers(cluster, groups, resources)
    }
}

#[async_trait]
impl Runnable for KubeApiMapProvider {
    fn name(&self) -> &str { "kube-api-map-provider" }

    async fn run(self: Arc<Self>, ctx: CancellationToken) {
        info!(clusters = self.clients.names().len(), interval_ms = self.interval.as_millis() as u64, "discovery started");
        let delivery = tokio::spawn(self.inner.clone().run(ctx.clone()));
        loop {
            self.refresh_all().await;
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        if let Err(e) = delivery.await {
            warn!(error = %e, "receiver delivery task failed");
        }
        info!("discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use placement_relations::RelayReceiver;

    fn ar(group: &str, version: &str, plural: &str) -> ApiResource {
        let api_version = if group.is_empty() { version.to_string() } else { format!("{group}/{version}") };
        ApiResource {
            group: group.into(),
            version: version.into(),
            api_version,
            kind: "Thing".into(),
            plural: plural.into(),
        }
    }

    fn caps(namespaced: bool, ops: &[&str]) -> ApiCapabilities {
        ApiCapabilities {
            scope: if namespaced { Scope::Namespaced } else { Scope::Cluster },
            subresources: vec![],
            operations: ops.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn versions_merge_and_preferred_wins() {
        let mut m = BTreeMap::new();
        let full = caps(true, &[verbs::LIST, verbs::WATCH, verbs::GET]);
        fold_resource(&mut m, &ar("apps", "v1beta1", "deployments"), &full, "v1");
        fold_resource(&mut m, &ar("apps", "v1", "deployments"), &full, "v1");
        let d = &m[&GroupResource::new("apps", "deployments")];
        assert!(d.namespaced && d.supports_informers);
        assert_eq!(d.preferred_version, "v1");
        assert_eq!(d.versions.as_slice(), ["v1beta1".to_string(), "v1".to_string()]);
    }

    #[test]
    fn unwatchable_resources_and_subresources() {
        let mut m = BTreeMap::new();
        fold_resource(&mut m, &ar("authorization.k8s.io", "v1", "selfsubjectreviews"), &caps(false, &["create"]), "v1");
        fold_resource(&mut m, &ar("", "v1", "pods/log"), &caps(true, &[verbs::GET]), "v1");
        assert_eq!(m.len(), 1);
        assert!(!m[&GroupResource::new("authorization.k8s.io", "selfsubjectreviews")].supports_informers);
    }

    #[derive(Default)]
    struct Heard(parking_lot::Mutex<Vec<(GroupResource, bool)>>);

    impl RelayReceiver<GroupResource, ResourceDetails> for Heard {
        fn set(&self, key: &GroupResource, val: Option<&ResourceDetails>) { self.0.lock().push((key.clone(), val.is_some())); }
    }

    #[test]
    fn repeated_rounds_publish_only_differences() {
        let map = ClusterApiMap::default();
        let heard = Arc::new(Heard::default());
        map.resources.add_receiver(heard.clone(), false);
        let full = caps(true, &[verbs::LIST, verbs::WATCH]);
        let mut round = BTreeMap::new();
        fold_resource(&mut round, &ar("", "v1", "configmaps"), &full, "v1");
        fold_resource(&mut round, &ar("apps", "v1", "deployments"), &full, "v1");
        let apps = BTreeMap::from([("apps".to_string(), GroupDetails::default())]);

        assert_eq!(publish(&map, apps.clone(), round.clone()), (2, 0));
        assert_eq!(publish(&map, apps.clone(), round.clone()), (0, 0));
        assert_eq!(heard.0.lock().len(), 2);

        round.remove(&GroupResource::new("apps", "deployments"));
        assert_eq!(publish(&map, BTreeMap::new(), round), (0, 1));
        assert_eq!(heard.0.lock().last(), Some(&(GroupResource::new("apps", "deployments"), false)));
        assert!(map.groups.keys().is_empty());
    }
}
