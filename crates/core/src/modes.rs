//! Classification of group-resources, injected into the binder rather than
//! read from a global table.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::GroupResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationMode {
    /// Selecting it is a user error.
    Error,
    /// Selecting it is ignored.
    Tolerate,
    Propagate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMode {
    pub propagation: PropagationMode,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceModes {
    overrides: FxHashMap<GroupResource, ResourceMode>,
    tolerated: FxHashSet<GroupResource>,
    tolerated_groups: FxHashSet<String>,
    unsupported: FxHashSet<GroupResource>,
}

fn set(items: &[(&str, &str)]) -> FxHashSet<GroupResource> {
    items.iter().map(|(g, r)| GroupResource::new(*g, *r)).collect()
}

impl ResourceModes {
    /// The well-known Kubernetes classifications.
    pub fn builtin() -> Self {
        Self {
            overrides: FxHashMap::default(),
            tolerated: set(&[
                ("apps", "controllerrevisions"),
                ("authentication.k8s.io", "tokenreviews"),
                ("authorization.k8s.io", "localsubjectaccessreviews"),
                ("authorization.k8s.io", "selfsubjectaccessreviews"),
                ("authorization.k8s.io", "selfsubjectrulesreviews"),
                ("authorization.k8s.io", "subjectaccessreviews"),
                ("certificates.k8s.io", "certificatesigningrequests"),
                ("events.k8s.io", "events"),
                ("", "bindings"),
                ("", "componentstatuses"),
                ("", "events"),
                ("", "nodes"),
            ]),
            tolerated_groups: ["edge.kubestellar.io"].iter().map(|s| s.to_string()).collect(),
            unsupported: set(&[("apiregistration.k8s.io", "apiservices")]),
        }
    }

    /// Pins one group-resource to a mode, ahead of every table.
    pub fn with(mut self, gr: GroupResource, mode: ResourceMode) -> Self {
        self.overrides.insert(gr, mode);
        self
    }

    pub fn get(&self, gr: &GroupResource) -> ResourceMode {
        if let Some(m) = self.overrides.get(gr) {
            return *m;
        }
        let propagation = if self.unsupported.contains(gr) {
            PropagationMode::Error
        } else if self.tolerated.contains(gr) || self.tolerated_groups.contains(&gr.group) {
            PropagationMode::Tolerate
        } else {
            PropagationMode::Propagate
        };
        ResourceMode { propagation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_classification() {
        let m = ResourceModes::builtin();
        assert_eq!(m.get(&GroupResource::new("", "configmaps")).propagation, PropagationMode::Propagate);
        assert_eq!(m.get(&GroupResource::new("", "serviceaccounts")).propagation, PropagationMode::Propagate);
        assert_eq!(m.get(&GroupResource::new("", "nodes")).propagation, PropagationMode::Tolerate);
        assert_eq!(m.get(&GroupResource::new("edge.kubestellar.io", "syncerconfigs")).propagation, PropagationMode::Tolerate);
        assert_eq!(m.get(&GroupResource::new("apiregistration.k8s.io", "apiservices")).propagation, PropagationMode::Error);
        assert_eq!(m.get(&GroupResource::new("example.com", "widgets")).propagation, PropagationMode::Propagate);
    }

    #[test]
    fn override_wins() {
        let gr = GroupResource::new("", "nodes");
        let m = ResourceModes::builtin().with(gr.clone(), ResourceMode { propagation: PropagationMode::Propagate });
        assert_eq!(m.get(&gr).propagation, PropagationMode::Propagate);
    }
}
