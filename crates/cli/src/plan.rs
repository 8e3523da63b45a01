//! Static placement plans: what each placement selects, where it goes, and
//! what every source cluster serves.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use placement_binder::InMemoryApiMapProvider;
use placement_core::prelude::*;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid plan: {0}")]
    Invalid(String),
}

fn yes() -> bool { true }

/// One resource a source cluster serves.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub group_resource: GroupResource,
    #[serde(default = "yes")]
    pub namespaced: bool,
    pub versions: Vec<String>,
    /// Defaults to the first of `versions`.
    #[serde(default)]
    pub preferred_version: Option<String>,
    #[serde(default = "yes")]
    pub supports_informers: bool,
}

impl CatalogEntry {
    pub fn details(&self) -> ResourceDetails {
        ResourceDetails {
            namespaced: self.namespaced,
            supports_informers: self.supports_informers,
            preferred_version: self
                .preferred_version
                .clone()
                .or_else(|| self.versions.first().cloned())
                .unwrap_or_default(),
            versions: self.versions.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartSpec {
    #[serde(flatten)]
    pub id: WorkloadPartID,
    #[serde(flatten)]
    pub details: WorkloadPartDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    /// Cluster the placement and its workload live in.
    pub cluster: ClusterName,
    pub name: String,
    #[serde(default)]
    pub what: Vec<PartSpec>,
    #[serde(default)]
    pub upsync: Vec<UpsyncSet>,
    #[serde(default, rename = "where")]
    pub wher: Vec<SinglePlacement>,
}

impl PlacementSpec {
    pub fn external_name(&self) -> ExternalName { ExternalName::new(self.cluster.clone(), self.name.clone()) }

    pub fn resolved_what(&self) -> ResolvedWhat {
        let parts = self.what.iter().map(|p| (p.id.clone(), p.details.clone())).collect();
        ResolvedWhat::new(parts, self.upsync.clone())
    }

    pub fn resolved_where(&self) -> ResolvedWhere {
        ResolvedWhere(vec![Arc::new(SinglePlacementSlice { destinations: self.wher.clone() })])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub clusters: BTreeMap<ClusterName, Vec<CatalogEntry>>,
    #[serde(default)]
    pub placements: Vec<PlacementSpec>,
}

impl Plan {
    /// Reads a YAML or JSON plan (by extension; YAML otherwise).
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Io { path: path.to_path_buf(), source })?;
        let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let plan = if is_json { Self::from_json(&raw) } else { Self::from_yaml(&raw) };
        plan.map_err(|e| match e {
            PlanError::Parse { message, .. } => PlanError::Parse { path: path.to_path_buf(), message },
            other => other,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_yaml::from_str(raw)
            .map_err(|e| PlanError::Parse { path: PathBuf::from("<yaml>"), message: e.to_string() })?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_json(raw: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_json::from_str(raw)
            .map_err(|e| PlanError::Parse { path: PathBuf::from("<json>"), message: e.to_string() })?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = BTreeSet::new();
        for p in &self.placements {
            if p.name.is_empty() || p.cluster.is_empty() {
                return Err(PlanError::Invalid("placements need a cluster and a name".into()));
            }
            if !seen.insert((p.cluster.as_str(), p.name.as_str())) {
                return Err(PlanError::Invalid(format!("placement {}/{} listed twice", p.cluster, p.name)));
            }
            if let Some(part) = p.what.iter().find(|w| w.id.name.is_empty() || w.id.group_resource.resource.is_empty()) {
                return Err(PlanError::Invalid(format!("placement {}: part {:?} needs a resource and a name", p.name, part.id)));
            }
        }
        for (cluster, entries) in &self.clusters {
            if let Some(e) = entries.iter().find(|e| e.versions.is_empty()) {
                return Err(PlanError::Invalid(format!("{cluster}: {} lists no versions", e.group_resource)));
            }
        }
        Ok(())
    }

    /// A provider serving exactly this plan's catalog.
    pub fn provider(&self) -> InMemoryApiMapProvider {
        let provider = InMemoryApiMapProvider::new(true);
        for (cluster, entries) in &self.clusters {
            for e in entries {
                provider.set_resource(cluster, e.group_resource.clone(), e.details());
            }
        }
        provider
    }

    /// Cluster names used anywhere in the plan: sources and mailboxes.
    pub fn cluster_names(&self) -> Vec<ClusterName> {
        let mut out: BTreeSet<ClusterName> = self.clusters.keys().cloned().collect();
        for p in &self.placements {
            out.insert(p.cluster.clone());
            out.extend(p.wher.iter().map(SinglePlacement::mailbox_name));
        }
        out.into_iter().collect()
    }
}
