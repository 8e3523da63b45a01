//! Source watches: one kube watcher per (source cluster, group-resource),
//! forwarding object changes to the projector.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use parking_lot::Mutex;
use placement_core::{ClusterName, GroupResource};
use placement_projector::{ObjectNotifier, SourceWatcher};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{ClusterClients, ResourceCache};

pub struct KubeSourceWatcher {
    shared: Arc<Shared>,
    tasks: Mutex<FxHashMap<(ClusterName, GroupResource), JoinHandle<()>>>,
    runtime: Handle,
}

struct Shared {
    clients: Arc<ClusterClients>,
    resources: ResourceCache,
    notifier: ObjectNotifier,
}

impl KubeSourceWatcher {
    /// Must be called from within a tokio runtime; watches run on it.
    pub fn new(clients: Arc<ClusterClients>, notifier: ObjectNotifier) -> Self {
        Self {
            shared: Arc::new(Shared { clients, resources: ResourceCache::default(), notifier }),
            tasks: Mutex::new(FxHashMap::default()),
            runtime: Handle::current(),
        }
    }

    pub fn active(&self) -> usize { self.tasks.lock().len() }
}

impl Drop for KubeSourceWatcher {
    fn drop(&mut self) {
        for (_, t) in self.tasks.lock().drain() {
            t.abort();
        }
    }
}

impl SourceWatcher for KubeSourceWatcher {
    fn watch(&self, source: &str, gr: &GroupResource, api_version: &str) {
        let key = (source.to_string(), gr.clone());
        let task = self.runtime.spawn(watch_loop(self.shared.clone(), key.clone(), api_version.to_string()));
        if let Some(old) = self.tasks.lock().insert(key, task) {
            old.abort();
        }
    }

    fn unwatch(&self, source: &str, gr: &GroupResource) {
        if let Some(t) = self.tasks.lock().remove(&(source.to_string(), gr.clone())) {
            t.abort();
            self.shared.resources.forget(source, gr);
            debug!(source, gr = %gr, "source watch stopped");
        }
    }
}

fn report(shared: &Shared, source: &str, gr: &GroupResource, o: &DynamicObject) {
    let ns = o.metadata.namespace.as_deref().unwrap_or_default();
    let name = o.metadata.name.as_deref().unwrap_or_default();
    shared.notifier.notify(source, gr, ns, name);
}

async fn watch_loop(shared: Arc<Shared>, (source, gr): (ClusterName, GroupResource), version: String) {
    let Some(client) = shared.clients.get(&source).cloned() else {
        warn!(source = %source, "no client for source cluster; not watching");
        return;
    };
    let ar = match shared.resources.resolve(&source, &client, &gr, &version).await {
        Ok((ar, _)) => ar,
        Err(e) => {
            warn!(source = %source, gr = %gr, error = %e, "cannot watch");
            return;
        }
    };
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(source = %source, gr = %gr, version = %version, "source watch started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => report(&shared, &source, &gr, &o),
            Ok(Event::Restarted(list)) => {
                debug!(source = %source, gr = %gr, count = list.len(), "watch restart");
                for o in &list {
                    report(&shared, &source, &gr, o);
                }
            }
            Err(e) => warn!(source = %source, gr = %gr, error = %e, "watch error"),
        }
    }
    warn!(source = %source, gr = %gr, "watch stream ended");
}
