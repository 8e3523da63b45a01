//! Placement kubehub (Milestone 0): kube-rs adapters behind the binder's
//! and the projector's seams. Discovery feeds an API-map provider, a
//! server-side-apply materializer writes mailboxes, and per-resource
//! watches report source object changes.

#![forbid(unsafe_code)]

mod discovery;
mod materializer;
mod watcher;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, GroupVersion};
use kube::discovery::{pinned_group, Scope};
use kube::Client;
use parking_lot::Mutex;
use placement_core::{ClusterName, GroupResource};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info};

pub use discovery::{fold_resource, KubeApiMapProvider};
pub use materializer::{classify, copy_for_destination, resolve_failure, source_is_system, KubeMaterializer};
pub use watcher::KubeSourceWatcher;

/// Default kube client from the ambient kubeconfig or in-cluster env.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building default kube client")
}

/// One kube client per logical cluster: workload sources and mailboxes alike.
#[derive(Clone, Default)]
pub struct ClusterClients {
    clients: FxHashMap<ClusterName, Client>,
}

impl ClusterClients {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, cluster: impl Into<ClusterName>, client: Client) { self.clients.insert(cluster.into(), client); }

    pub fn get(&self, cluster: &str) -> Option<&Client> { self.clients.get(cluster) }

    pub fn names(&self) -> Vec<ClusterName> {
        let mut v: Vec<_> = self.clients.keys().cloned().collect();
        v.sort();
        v
    }

    /// A client per kubeconfig context, keyed by context name.
    pub async fn from_kubeconfig_contexts(contexts: &[String]) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().context("reading kubeconfig")?;
        let wanted: Vec<String> = if contexts.is_empty() {
            kubeconfig.contexts.iter().map(|c| c.name.clone()).collect()
        } else {
            contexts.to_vec()
        };
        let mut out = Self::new();
        for ctx in wanted {
            let opts = KubeConfigOptions { context: Some(ctx.clone()), ..Default::default() };
            let cfg = kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &opts)
                .await
                .with_context(|| format!("loading kubeconfig context {ctx}"))?;
            let client = Client::try_from(cfg).with_context(|| format!("building client for context {ctx}"))?;
            debug!(context = %ctx, "kube client ready");
            out.insert(ctx, client);
        }
        info!(clusters = out.clients.len(), "kube clients loaded from kubeconfig");
        Ok(out)
    }

    /// Clients for logical clusters served under `{server}/clusters/{name}`
    /// of one base configuration.
    pub fn for_logical_clusters(base: &kube::Config, names: &[String]) -> Result<Self> {
        let mut out = Self::new();
        for name in names {
            let mut cfg = base.clone();
            cfg.cluster_url = logical_cluster_url(&base.cluster_url.to_string(), name)
                .parse()
                .with_context(|| format!("cluster url for {name}"))?;
            let client = Client::try_from(cfg).with_context(|| format!("building client for {name}"))?;
            out.insert(name.clone(), client);
        }
        Ok(out)
    }
}

pub(crate) fn logical_cluster_url(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base.split("/clusters/").next().unwrap_or(base);
    format!("{base}/clusters/{name}")
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The cluster answered and does not serve the resource at that version.
    #[error("{gr} is not served at {version} in {cluster}")]
    NotServed { cluster: ClusterName, gr: GroupResource, version: String },
    #[error("discovering {api_version} in {cluster}: {source}")]
    Discovery { cluster: ClusterName, api_version: String, source: kube::Error },
}

impl ResolveError {
    /// A missing group-version is an answer, not a failure to get one.
    pub(crate) fn from_discovery(cluster: &str, gr: &GroupResource, version: &str, e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                Self::NotServed { cluster: cluster.to_string(), gr: gr.clone(), version: version.to_string() }
            }
            source => Self::Discovery {
                cluster: cluster.to_string(),
                api_version: GroupVersion::gv(&gr.group, version).api_version(),
                source,
            },
        }
    }
}

/// Resolves (group-resource, version) to an [`ApiResource`] and its scope,
/// remembering answers per cluster.
#[derive(Default)]
pub(crate) struct ResourceCache {
    known: Mutex<FxHashMap<(ClusterName, GroupResource, String), (ApiResource, bool)>>,
}

impl ResourceCache {
    pub(crate) async fn resolve(
        &self,
        cluster: &str,
        client: &Client,
        gr: &GroupResource,
        version: &str,
    ) -> Result<(ApiResource, bool), ResolveError> {
        let key = (cluster.to_string(), gr.clone(), version.to_string());
        if let Some(hit) = self.known.lock().get(&key) {
            return Ok(hit.clone());
        }
        let gv = GroupVersion::gv(&gr.group, version);
        let group = pinned_group(client, &gv)
            .await
            .map_err(|e| ResolveError::from_discovery(cluster, gr, version, e))?;
        let (ar, caps) = group
            .versioned_resources(version)
            .into_iter()
            .find(|(ar, _)| ar.plural == gr.resource)
            .ok_or_else(|| ResolveError::NotServed {
                cluster: cluster.to_string(),
                gr: gr.clone(),
                version: version.to_string(),
            })?;
        let found = (ar, matches!(caps.scope, Scope::Namespaced));
        self.known.lock().insert(key, found.clone());
        Ok(found)
    }

    pub(crate) fn forget(&self, cluster: &str, gr: &GroupResource) {
        self.known.lock().retain(|(c, g, _), _| !(c == cluster && g == gr));
    }
}
