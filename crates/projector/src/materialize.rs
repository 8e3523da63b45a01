//! Seams to the outside world: writing to destinations and watching sources.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use placement_core::{ClusterName, DistributionBits, GroupResource, SinglePlacement};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::syncfg::SyncerConfigSpec;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    /// Worth retrying later (timeouts, conflicts, unreachable servers).
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help (rejected object, unknown resource).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl MaterializeError {
    pub fn is_retryable(&self) -> bool { matches!(self, Self::Transient(_)) }
}

/// One source object as seen from one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub source: ClusterName,
    pub group_resource: GroupResource,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
    pub dest: SinglePlacement,
}

impl ObjectRef {
    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }
}

/// Writes the plan into destination mailboxes.
#[async_trait]
pub trait Materializer: Send + Sync {
    async fn apply_sync_config(&self, dest: &SinglePlacement, spec: &SyncerConfigSpec) -> Result<(), MaterializeError>;

    /// Copies the current source object to the destination.
    async fn upsert_object(&self, obj: &ObjectRef, api_version: &str, bits: DistributionBits) -> Result<(), MaterializeError>;

    /// Removes the destination copy. `api_version` is the last version the
    /// object was projected with, when still known.
    async fn delete_object(&self, obj: &ObjectRef, api_version: Option<&str>) -> Result<(), MaterializeError>;
}

/// Keeps source watches in step with the plan. Called with the projector
/// lock held: implementations must only record or spawn.
pub trait SourceWatcher: Send + Sync {
    fn watch(&self, source: &str, gr: &GroupResource, api_version: &str);
    fn unwatch(&self, source: &str, gr: &GroupResource);
}

/// Watches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatcher;

impl SourceWatcher for NullWatcher {
    fn watch(&self, _source: &str, _gr: &GroupResource, _api_version: &str) {}
    fn unwatch(&self, _source: &str, _gr: &GroupResource) {}
}

/// A source object whose content changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceObjectEvent {
    pub source: ClusterName,
    pub group_resource: GroupResource,
    pub namespace: String,
    pub name: String,
}

/// Handed to source watchers; the projector drains the other end.
#[derive(Debug, Clone)]
pub struct ObjectNotifier {
    tx: mpsc::UnboundedSender<SourceObjectEvent>,
}

impl ObjectNotifier {
    pub fn notify(&self, source: &str, gr: &GroupResource, namespace: &str, name: &str) {
        let ev = SourceObjectEvent {
            source: source.to_string(),
            group_resource: gr.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        if self.tx.send(ev).is_err() {
            debug!(source, gr = %gr, "object notification after projector shutdown");
        }
    }
}

pub type ObjectEvents = mpsc::UnboundedReceiver<SourceObjectEvent>;

pub fn object_channel() -> (ObjectNotifier, ObjectEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ObjectNotifier { tx }, rx)
}

/// What a [`RecordingMaterializer`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Applied {
    SyncConfig { dest: SinglePlacement, spec: SyncerConfigSpec },
    Upsert { object: ObjectRef, api_version: String, bits: DistributionBits },
    Delete { object: ObjectRef, api_version: Option<String> },
}

/// In-memory materializer: records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingMaterializer {
    log: Mutex<Vec<Applied>>,
    failures: Mutex<VecDeque<MaterializeError>>,
}

impl RecordingMaterializer {
    pub fn new() -> Self { Self::default() }

    /// The next `apply`/`upsert`/`delete` calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = MaterializeError>) {
        self.failures.lock().extend(errors);
    }

    pub fn applied(&self) -> Vec<Applied> { self.log.lock().clone() }

    pub fn take(&self) -> Vec<Applied> { std::mem::take(&mut *self.log.lock()) }

    fn record(&self, a: Applied) -> Result<(), MaterializeError> {
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        debug!(?a, "materialized");
        self.log.lock().push(a);
        Ok(())
    }
}

#[async_trait]
impl Materializer for RecordingMaterializer {
    async fn apply_sync_config(&self, dest: &SinglePlacement, spec: &SyncerConfigSpec) -> Result<(), MaterializeError> {
        self.record(Applied::SyncConfig { dest: dest.clone(), spec: spec.clone() })
    }

    async fn upsert_object(&self, obj: &ObjectRef, api_version: &str, bits: DistributionBits) -> Result<(), MaterializeError> {
        self.record(Applied::Upsert { object: obj.clone(), api_version: api_version.to_string(), bits })
    }

    async fn delete_object(&self, obj: &ObjectRef, api_version: Option<&str>) -> Result<(), MaterializeError> {
        self.record(Applied::Delete { object: obj.clone(), api_version: api_version.map(str::to_string) })
    }
}
