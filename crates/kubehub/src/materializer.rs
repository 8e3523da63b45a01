//! Server-side-apply materializer: copies source objects into destination
//! mailboxes and keeps each mailbox's `SyncerConfig` current.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::{counter, histogram};
use placement_core::{object_is_system, DistributionBits, GroupResource, SinglePlacement};
use placement_projector::{MaterializeError, Materializer, ObjectRef, SyncerConfigSpec, FIELD_MANAGER, SYNCER_CONFIG_NAME};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{ClusterClients, ResolveError, ResourceCache};

/// Annotation that asks the destination to report its state back.
pub const RETURN_SINGLETON_STATE: &str = "edge.kubestellar.io/return-singleton-state";

fn syncer_config_resource() -> ApiResource {
    ApiResource {
        group: "edge.kubestellar.io".into(),
        version: "v2alpha1".into(),
        api_version: "edge.kubestellar.io/v2alpha1".into(),
        kind: "SyncerConfig".into(),
        plural: "syncerconfigs".into(),
    }
}

/// Maps a kube error onto retry policy: throttling, conflicts and server
/// side failures are transient, other API rejections permanent.
pub fn classify(e: kube::Error) -> MaterializeError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 || ae.code >= 500 => {
            MaterializeError::Transient(ae.to_string())
        }
        kube::Error::Api(ae) => MaterializeError::Permanent(ae.to_string()),
        other => MaterializeError::Transient(other.to_string()),
    }
}

fn is_not_found(e: &kube::Error) -> bool { matches!(e, kube::Error::Api(ae) if ae.code == 404) }

/// A group-version the cluster does not serve will not start serving by
/// retrying; only a failed discovery call is worth another try.
pub fn resolve_failure(e: ResolveError) -> MaterializeError {
    match e {
        ResolveError::NotServed { .. } => MaterializeError::Permanent(e.to_string()),
        ResolveError::Discovery { .. } => MaterializeError::Transient(e.to_string()),
    }
}

/// The content-aware half of the system filter: unlike the binder, this
/// sees a secret's type.
pub fn source_is_system(gr: &GroupResource, src: &DynamicObject) -> bool {
    let name = src.metadata.name.as_deref().unwrap_or_default();
    object_is_system(gr, name, src.data.get("type").and_then(Value::as_str))
}

/// The mailbox copy of a source object: server-populated metadata and
/// status are dropped so that applying it claims only what the source says.
pub fn copy_for_destination(src: &DynamicObject, bits: DistributionBits) -> Value {
    let mut meta = json!({ "name": src.metadata.name });
    if let Some(ns) = &src.metadata.namespace {
        meta["namespace"] = json!(ns);
    }
    if let Some(labels) = src.metadata.labels.as_ref().filter(|l| !l.is_empty()) {
        meta["labels"] = json!(labels);
    }
    let mut annotations = src.metadata.annotations.clone().unwrap_or_default();
    annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
    if bits.return_singleton_state {
        annotations.insert(RETURN_SINGLETON_STATE.to_string(), "true".to_string());
    }
    if !annotations.is_empty() {
        meta["annotations"] = json!(annotations);
    }
    let mut out = match &src.data {
        Value::Object(m) => Value::Object(m.clone()),
        _ => json!({}),
    };
    if let Some(m) = out.as_object_mut() {
        m.remove("status");
        m.remove("metadata");
    }
    if let Some(tm) = &src.types {
        out["apiVersion"] = json!(tm.api_version);
        out["kind"] = json!(tm.kind);
    }
    out["metadata"] = meta;
    out
}

pub struct KubeMaterializer {
    clients: Arc<ClusterClients>,
    resources: ResourceCache,
    include_system_objects: bool,
}

impl KubeMaterializer {
    pub fn new(clients: Arc<ClusterClients>, include_system_objects: bool) -> Self {
        Self { clients, resources: ResourceCache::default(), include_system_objects }
    }

    fn client(&self, cluster: &str) -> Result<Client, MaterializeError> {
        self.clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| MaterializeError::Permanent(format!("no client for cluster {cluster}")))
    }

    async fn api_for(
        &self,
        cluster: &str,
        gr: &GroupResource,
        version: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, MaterializeError> {
        let client = self.client(cluster)?;
        let (ar, namespaced) = self.resources.resolve(cluster, &client, gr, version).await.map_err(resolve_failure)?;
        Ok(if namespaced {
            Api::namespaced_with(client, namespace, &ar)
        } else {
            Api::all_with(client, &ar)
        })
    }

    async fn ensure_namespace(&self, mailbox: &Client, namespace: &str) -> Result<(), MaterializeError> {
        let api: Api<Namespace> = Api::all(mailbox.clone());
        let ns = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": namespace } });
        api.patch(namespace, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns)).await.map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl Materializer for KubeMaterializer {
    async fn apply_sync_config(&self, dest: &SinglePlacement, spec: &SyncerConfigSpec) -> Result<(), MaterializeError> {
        let mailbox = dest.mailbox_name();
        let api: Api<DynamicObject> = Api::all_with(self.client(&mailbox)?, &syncer_config_resource());
        if spec.is_empty() {
            return match api.delete(SYNCER_CONFIG_NAME, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(classify(e)),
            };
        }
        let obj = json!({
            "apiVersion": "edge.kubestellar.io/v2alpha1",
            "kind": "SyncerConfig",
            "metadata": { "name": SYNCER_CONFIG_NAME },
            "spec": spec,
        });
        let t0 = Instant::now();
        api.patch(SYNCER_CONFIG_NAME, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map_err(classify)?;
        histogram!("kubehub_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(mailbox = %mailbox, "sync configuration applied");
        Ok(())
    }

    async fn upsert_object(&self, obj: &ObjectRef, api_version: &str, bits: DistributionBits) -> Result<(), MaterializeError> {
        let source = self.api_for(&obj.source, &obj.group_resource, api_version, &obj.namespace).await?;
        let Some(src) = source.get_opt(&obj.name).await.map_err(classify)? else {
            debug!(source = %obj.source, gr = %obj.group_resource, name = %obj.name, "source object gone; removing copy");
            return self.delete_object(obj, Some(api_version)).await;
        };
        if !self.include_system_objects && source_is_system(&obj.group_resource, &src) {
            debug!(gr = %obj.group_resource, name = %obj.name, "not copying system object");
            return Ok(());
        }
        let mailbox = obj.dest.mailbox_name();
        let mailbox_client = self.client(&mailbox)?;
        if obj.is_namespaced() {
            self.ensure_namespace(&mailbox_client, &obj.namespace).await?;
        }
        let dest = self.api_for(&mailbox, &obj.group_resource, api_version, &obj.namespace).await?;
        if bits.create_only && dest.get_opt(&obj.name).await.map_err(classify)?.is_some() {
            return Ok(());
        }
        let body = copy_for_destination(&src, bits);
        let t0 = Instant::now();
        dest.patch(&obj.name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .map_err(classify)?;
        histogram!("kubehub_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kubehub_objects_applied_total", 1u64);
        debug!(mailbox = %mailbox, gr = %obj.group_resource, ns = %obj.namespace, name = %obj.name, "object applied");
        Ok(())
    }

    async fn delete_object(&self, obj: &ObjectRef, api_version: Option<&str>) -> Result<(), MaterializeError> {
        let Some(version) = api_version else {
            return Err(MaterializeError::Permanent(format!(
                "no known version to delete {} {} from {}",
                obj.group_resource, obj.name, obj.dest
            )));
        };
        let mailbox = obj.dest.mailbox_name();
        let dest = self.api_for(&mailbox, &obj.group_resource, version, &obj.namespace).await?;
        match dest.delete(&obj.name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("kubehub_objects_deleted_total", 1u64);
                debug!(mailbox = %mailbox, gr = %obj.group_resource, name = %obj.name, "object deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: "r".into(), code })
    }

    #[test]
    fn retry_policy_follows_status_codes() {
        assert!(classify(api_err(409)).is_retryable());
        assert!(classify(api_err(429)).is_retryable());
        assert!(classify(api_err(503)).is_retryable());
        assert!(!classify(api_err(422)).is_retryable());
        assert!(!classify(api_err(403)).is_retryable());
        assert!(is_not_found(&api_err(404)));
    }

    fn secret(name: &str, kind: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": name, "namespace": "team" },
            "type": kind,
        }))
        .unwrap()
    }

    #[test]
    fn token_secrets_are_recognised_by_content() {
        let secrets = GroupResource::new("", "secrets");
        assert!(source_is_system(&secrets, &secret("builder-token-x7", "kubernetes.io/service-account-token")));
        assert!(source_is_system(&secrets, &secret("bootstrap-token-abc", "bootstrap.kubernetes.io/token")));
        assert!(!source_is_system(&secrets, &secret("db-password", "Opaque")));
        // The binder only knows the name, so it lets token secrets through.
        assert!(!object_is_system(&secrets, "builder-token-x7", None));
    }

    #[test]
    fn unserved_versions_are_not_retried() {
        let gr = GroupResource::new("example.com", "widgets");
        let missing = ResolveError::from_discovery("inv1-mb-u1", &gr, "v1", api_err(404));
        assert!(matches!(missing, ResolveError::NotServed { .. }));
        assert!(!resolve_failure(missing).is_retryable());
        let unreachable = ResolveError::from_discovery("inv1-mb-u1", &gr, "v1", api_err(503));
        assert!(matches!(unreachable, ResolveError::Discovery { .. }));
        assert!(resolve_failure(unreachable).is_retryable());
        let absent = ResolveError::NotServed { cluster: "wmw1".into(), gr, version: "v2".into() };
        assert_eq!(absent.to_string(), "widgets.example.com is not served at v2 in wmw1");
        assert!(!resolve_failure(absent).is_retryable());
    }

    #[test]
    fn copies_drop_server_fields() {
        let src: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm1",
                "namespace": "default",
                "uid": "1234",
                "resourceVersion": "77",
                "managedFields": [{"manager": "kubectl"}],
                "labels": {"app": "demo"},
                "annotations": {"kubectl.kubernetes.io/last-applied-configuration": "{}"}
            },
            "data": {"k": "v"},
            "status": {"x": 1}
        }))
        .unwrap();
        let out = copy_for_destination(&src, DistributionBits { create_only: false, return_singleton_state: true });
        assert_eq!(out["apiVersion"], "v1");
        assert_eq!(out["kind"], "ConfigMap");
        assert_eq!(out["data"]["k"], "v");
        assert!(out.get("status").is_none());
        assert_eq!(
            out["metadata"],
            json!({
                "name": "cm1",
                "namespace": "default",
                "labels": {"app": "demo"},
                "annotations": {RETURN_SINGLETON_STATE: "true"}
            })
        );
    }
}
