//! Per-destination sync configuration.
//!
//! A destination's config is a pure function of the plan restricted to one destination;
//! every list is sorted so that equal plans give equal configs.

use std::collections::{BTreeMap, BTreeSet};

use placement_core::UpsyncSet;
use serde::{Deserialize, Serialize};

/// Name of the single sync configuration object in each mailbox.
pub const SYNCER_CONFIG_NAME: &str = "the-one";

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "placement-translator";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceScope {
    pub namespaces: Vec<String>,
    pub resources: Vec<GroupVersionResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceAndNames {
    pub namespace: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedObjects {
    #[serde(flatten)]
    pub resource: GroupVersionResource,
    pub objects_by_namespace: Vec<NamespaceAndNames>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScopeObjects {
    #[serde(flatten)]
    pub resource: GroupVersionResource,
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncerConfigSpec {
    pub namespace_scope: NamespaceScope,
    pub namespaced_objects: Vec<NamespacedObjects>,
    pub cluster_scope: Vec<ClusterScopeObjects>,
    pub upsync: Vec<UpsyncSet>,
}

impl SyncerConfigSpec {
    pub fn is_empty(&self) -> bool {
        self.namespace_scope.namespaces.is_empty()
            && self.namespaced_objects.is_empty()
            && self.cluster_scope.is_empty()
            && self.upsync.is_empty()
    }
}

/// Accumulates one destination's objects in sorted form.
#[derive(Default)]
pub(crate) struct SpecBuilder {
    namespaced: BTreeMap<GroupVersionResource, BTreeMap<String, BTreeSet<String>>>,
    cluster_scoped: BTreeMap<GroupVersionResource, BTreeSet<String>>,
    upsync: Vec<UpsyncSet>,
}

impl SpecBuilder {
    pub(crate) fn namespaced(&mut self, gvr: GroupVersionResource, namespace: &str, name: &str) {
        self.namespaced
            .entry(gvr)
            .or_default()
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub(crate) fn cluster_scoped(&mut self, gvr: GroupVersionResource, name: &str) {
        self.cluster_scoped.entry(gvr).or_default().insert(name.to_string());
    }

    pub(crate) fn upsync(&mut self, u: &UpsyncSet) {
        let norm = |v: &[String]| -> Vec<String> { v.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect() };
        self.upsync.push(UpsyncSet {
            api_group: u.api_group.clone(),
            resources: norm(&u.resources),
            namespaces: norm(&u.namespaces),
            names: norm(&u.names),
        });
    }

    pub(crate) fn build(mut self) -> SyncerConfigSpec {
        let namespaces: BTreeSet<String> =
            self.namespaced.values().flat_map(|by_ns| by_ns.keys().cloned()).collect();
        let resources: Vec<GroupVersionResource> = self.namespaced.keys().cloned().collect();
        let namespaced_objects = self
            .namespaced
            .into_iter()
            .map(|(resource, by_ns)| NamespacedObjects {
                resource,
                objects_by_namespace: by_ns
                    .into_iter()
                    .map(|(namespace, names)| NamespaceAndNames { namespace, names: names.into_iter().collect() })
                    .collect(),
            })
            .collect();
        let cluster_scope = self
            .cluster_scoped
            .into_iter()
            .map(|(resource, names)| ClusterScopeObjects { resource, objects: names.into_iter().collect() })
            .collect();
        self.upsync.sort_by(|a, b| {
            (&a.api_group, &a.resources, &a.namespaces, &a.names).cmp(&(&b.api_group, &b.resources, &b.namespaces, &b.names))
        });
        self.upsync.dedup();
        SyncerConfigSpec {
            namespace_scope: NamespaceScope { namespaces: namespaces.into_iter().collect(), resources },
            namespaced_objects,
            cluster_scope,
            upsync: self.upsync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvr(group: &str, version: &str, resource: &str) -> GroupVersionResource {
        GroupVersionResource { group: group.into(), version: version.into(), resource: resource.into() }
    }

    #[test]
    fn build_is_order_independent() {
        let mut a = SpecBuilder::default();
        a.namespaced(gvr("", "v1", "configmaps"), "ns2", "b");
        a.namespaced(gvr("", "v1", "configmaps"), "ns1", "a");
        a.namespaced(gvr("apps", "v1", "deployments"), "ns1", "d");
        a.cluster_scoped(gvr("", "v1", "namespaces"), "ns1");
        let mut b = SpecBuilder::default();
        b.cluster_scoped(gvr("", "v1", "namespaces"), "ns1");
        b.namespaced(gvr("apps", "v1", "deployments"), "ns1", "d");
        b.namespaced(gvr("", "v1", "configmaps"), "ns1", "a");
        b.namespaced(gvr("", "v1", "configmaps"), "ns2", "b");
        let (a, b) = (a.build(), b.build());
        assert_eq!(a, b);
        assert_eq!(a.namespace_scope.namespaces, vec!["ns1", "ns2"]);
        assert_eq!(a.namespace_scope.resources.len(), 2);
        assert_eq!(a.namespaced_objects[0].resource.resource, "configmaps");
        assert!(!a.is_empty());
        assert!(SpecBuilder::default().build().is_empty());
    }

    #[test]
    fn upsyncs_are_normalized() {
        let mut a = SpecBuilder::default();
        let u = |names: &[&str]| UpsyncSet {
            api_group: "g".into(),
            resources: vec!["r".into()],
            namespaces: vec!["*".into()],
            names: names.iter().map(|s| s.to_string()).collect(),
        };
        a.upsync(&u(&["y", "x", "x"]));
        a.upsync(&u(&["x", "y"]));
        let spec = a.build();
        assert_eq!(spec.upsync, vec![u(&["x", "y"])]);
    }
}
