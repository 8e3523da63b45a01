//! Placement core types (Milestone 0)

#![forbid(unsafe_code)]

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod lockorder;
pub mod modes;
pub mod projection;
pub mod receivers;
pub mod runnable;
pub mod versions;

pub type ClusterName = String;

/// Identifies a cluster-scoped object (a placement rule, or a cluster-scoped
/// workload object) in a given cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ExternalName {
    pub cluster: ClusterName,
    pub name: String,
}

impl ExternalName {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), name: name.into() }
    }
}

impl fmt::Display for ExternalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cluster, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct GroupResource {
    #[serde(default)]
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), resource: resource.into() }
    }

    pub fn namespaces() -> Self { Self::new("", "namespaces") }

    pub fn is_namespaces(&self) -> bool { self.group.is_empty() && self.resource == "namespaces" }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// One destination. The UID tells apart destinations that reuse a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SinglePlacement {
    pub cluster: ClusterName,
    pub location_name: String,
    pub sync_target_name: String,
    pub sync_target_uid: String,
}

impl SinglePlacement {
    /// Name of the per-destination staging area the projector writes into.
    pub fn mailbox_name(&self) -> String {
        format!("{}-mb-{}", self.cluster, self.sync_target_uid)
    }
}

impl fmt::Display for SinglePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.location_name, self.sync_target_name)
    }
}

/// Identifies one selected workload object. For a namespace part the
/// group-resource is `namespaces`, the namespace is empty and `name` is the
/// namespace's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadPartID {
    #[serde(flatten)]
    pub group_resource: GroupResource,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl WorkloadPartID {
    pub fn new(gr: GroupResource, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group_resource: gr, namespace: namespace.into(), name: name.into() }
    }

    pub fn is_namespace_part(&self) -> bool { self.group_resource.is_namespaces() }
}

/// Per-object delivery annotations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadPartDetails {
    /// Preferred API version; empty means "let discovery decide".
    pub api_version: String,
    pub include_namespace_object: bool,
    pub create_only: bool,
    pub return_singleton_state: bool,
}

/// Objects that flow from a destination back to the source.
/// `"*"` in any list matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpsyncSet {
    pub api_group: String,
    pub resources: Vec<String>,
    pub namespaces: Vec<String>,
    pub names: Vec<String>,
}

impl UpsyncSet {
    pub fn matches(&self, gr: &GroupResource, namespace: &str, name: &str) -> bool {
        fn hit(pats: &[String], v: &str) -> bool { pats.iter().any(|p| p == "*" || p == v) }
        self.api_group == gr.group
            && hit(&self.resources, &gr.resource)
            && (namespace.is_empty() || hit(&self.namespaces, namespace))
            && hit(&self.names, name)
    }
}

pub type WorkloadParts = FxHashMap<WorkloadPartID, WorkloadPartDetails>;

/// Immutable snapshot of one placement rule's what-resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedWhat {
    pub workload_parts: Arc<WorkloadParts>,
    pub upsync: Arc<[UpsyncSet]>,
}

impl ResolvedWhat {
    pub fn new(parts: WorkloadParts, upsync: Vec<UpsyncSet>) -> Self {
        Self { workload_parts: Arc::new(parts), upsync: upsync.into() }
    }
}

/// One immutable slice of destinations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SinglePlacementSlice {
    pub destinations: Vec<SinglePlacement>,
}

/// Ordered collection of destination slices; a set of destinations once flattened.
#[derive(Debug, Clone, Default)]
pub struct ResolvedWhere(pub Vec<Arc<SinglePlacementSlice>>);

impl ResolvedWhere {
    pub fn destinations(&self) -> impl Iterator<Item = &SinglePlacement> + '_ {
        self.0.iter().flat_map(|s| s.destinations.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionModeKey {
    pub group_resource: GroupResource,
    pub destination: SinglePlacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionModeVal {
    pub api_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBits {
    pub create_only: bool,
    pub return_singleton_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

/// A namespaced object in a given cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedExternalName {
    pub cluster: ClusterName,
    pub namespace: String,
    pub name: String,
}

/// Identity of a source object, splittable into its cluster and the
/// cluster-local remainder.
pub trait SourceObject: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static {
    type Local: Clone + Eq + Hash + Ord + fmt::Debug + Send + Sync + 'static;

    fn cluster(&self) -> &str;
    fn namespace(&self) -> &str;
    fn name(&self) -> &str;
    fn split(self) -> (ClusterName, Self::Local);
    fn join(cluster: ClusterName, local: Self::Local) -> Self;
}

impl SourceObject for ExternalName {
    type Local = String;

    fn cluster(&self) -> &str { &self.cluster }
    fn namespace(&self) -> &str { "" }
    fn name(&self) -> &str { &self.name }
    fn split(self) -> (ClusterName, String) { (self.cluster, self.name) }
    fn join(cluster: ClusterName, name: String) -> Self { Self { cluster, name } }
}

impl SourceObject for NamespacedExternalName {
    type Local = NamespacedName;

    fn cluster(&self) -> &str { &self.cluster }
    fn namespace(&self) -> &str { &self.namespace }
    fn name(&self) -> &str { &self.name }
    fn split(self) -> (ClusterName, NamespacedName) {
        (self.cluster, NamespacedName { namespace: self.namespace, name: self.name })
    }
    fn join(cluster: ClusterName, local: NamespacedName) -> Self {
        Self { cluster, namespace: local.namespace, name: local.name }
    }
}

/// "This object goes to this destination, as this group-resource."
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Distribution<O> {
    pub key: ProjectionModeKey,
    pub object: O,
}

pub type NamespacedDistributionTuple = Distribution<NamespacedExternalName>;
pub type NonNamespacedDistributionTuple = Distribution<ExternalName>;

/// What discovery says about one group-resource in one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceDetails {
    pub namespaced: bool,
    pub supports_informers: bool,
    pub preferred_version: String,
    pub versions: SmallVec<[String; 2]>,
}

/// Objects every cluster carries on its own; never projected unless asked.
///
/// Secrets are told apart by their type, which only the object itself
/// carries. Callers that know just the name pass `None` and so catch the
/// name-based cases only; the copy step checks again with the content.
pub fn object_is_system(gr: &GroupResource, name: &str, secret_type: Option<&str>) -> bool {
    if !gr.group.is_empty() {
        return false;
    }
    match gr.resource.as_str() {
        "secrets" => matches!(
            secret_type,
            Some("kubernetes.io/service-account-token") | Some("bootstrap.kubernetes.io/token")
        ),
        "configmaps" => name == "kube-root-ca.crt",
        "serviceaccounts" => name == "default",
        _ => false,
    }
}

pub mod prelude {
    pub use super::{
        ClusterName, Distribution, DistributionBits, ExternalName, GroupResource, NamespacedDistributionTuple,
        NamespacedExternalName, NamespacedName, NonNamespacedDistributionTuple, ProjectionModeKey,
        ProjectionModeVal, ResolvedWhat, ResolvedWhere, ResourceDetails, SinglePlacement, SinglePlacementSlice,
        SourceObject, UpsyncSet, WorkloadPartDetails, WorkloadPartID, WorkloadParts,
    };
    pub use super::projection::{WorkloadProjectionSections, WorkloadProjector};
    pub use super::receivers::{Adder, Deleter, MappingReceiver, Putter, Receiver, Remover, SetChangeReceiver, Visitor};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_name_uses_cluster_and_uid() {
        let sp = SinglePlacement {
            cluster: "inv1".into(),
            location_name: "loc".into(),
            sync_target_name: "st".into(),
            sync_target_uid: "u-1".into(),
        };
        assert_eq!(sp.mailbox_name(), "inv1-mb-u-1");
    }

    #[test]
    fn system_objects_are_recognized() {
        let cm = GroupResource::new("", "configmaps");
        assert!(object_is_system(&cm, "kube-root-ca.crt", None));
        assert!(!object_is_system(&cm, "app-config", None));
        let sec = GroupResource::new("", "secrets");
        assert!(object_is_system(&sec, "x", Some("kubernetes.io/service-account-token")));
        assert!(!object_is_system(&sec, "x", Some("Opaque")));
        assert!(object_is_system(&GroupResource::new("", "serviceaccounts"), "default", None));
        assert!(!object_is_system(&GroupResource::new("apps", "configmaps"), "kube-root-ca.crt", None));
    }

    #[test]
    fn upsync_wildcards() {
        let u = UpsyncSet {
            api_group: "group1.test".into(),
            resources: vec!["sprockets".into()],
            namespaces: vec!["*".into()],
            names: vec!["n1".into(), "n2".into()],
        };
        let gr = GroupResource::new("group1.test", "sprockets");
        assert!(u.matches(&gr, "ns1", "n2"));
        assert!(!u.matches(&gr, "ns1", "n3"));
        assert!(!u.matches(&GroupResource::new("", "sprockets"), "ns1", "n1"));
    }

    #[test]
    fn source_object_split_join() {
        let o = NamespacedExternalName { cluster: "c".into(), namespace: "ns".into(), name: "n".into() };
        let (c, l) = o.clone().split();
        assert_eq!(NamespacedExternalName::join(c, l), o);
    }
}
