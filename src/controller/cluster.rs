//! Cluster access seam
//!
//! Everything the controller reads or writes goes through [`ClusterClient`]:
//! arbitrary workload/trait objects as `DynamicObject`s addressed by
//! [`TrackedResource`] identity, ResourceTrackers, ApplicationRevisions and
//! the AppRollout finalizer/status subresources.
//!
//! All writes carry the object's `resourceVersion`; a stale version surfaces
//! as [`ClusterError::Conflict`] and callers retry against a fresh read.

use crate::crd::app_revision::ApplicationRevision;
use crate::crd::app_rollout::{AppRollout, OMITTABLE_STATUS_FIELDS};
use crate::crd::resource_tracker::{ResourceTracker, TrackedResource};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Conflict writing {0}: object was modified")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Failed to serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to resolve API resource for {0}: {1}")]
    Discovery(String, String),

    #[error("Object {0} has no apiVersion/kind")]
    MissingTypeMeta(String),
}

impl ClusterError {
    /// Optimistic-concurrency failure; retry against a fresh read
    pub fn is_conflict(&self) -> bool {
        match self {
            ClusterError::Conflict(_) => true,
            ClusterError::Kube(kube::Error::Api(err)) => err.code == 409,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NotFound(_) => true,
            ClusterError::Kube(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    /// Errors worth requeueing without operator intervention
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Conflict(_) => true,
            ClusterError::Kube(kube::Error::Api(err)) => err.code == 409 || err.code >= 500,
            ClusterError::Kube(_) => true,
            _ => false,
        }
    }
}

/// Identity of a dynamic object
pub fn resource_ref(obj: &DynamicObject) -> Result<TrackedResource, ClusterError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| ClusterError::MissingTypeMeta(obj.name_any()))?;
    Ok(TrackedResource {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        namespace: obj.namespace(),
        name: obj.name_any(),
    })
}

/// Operations the controller performs against the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_resource(
        &self,
        resource: &TrackedResource,
    ) -> Result<Option<DynamicObject>, ClusterError>;

    async fn create_resource(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Replace guarded by `metadata.resourceVersion`
    async fn replace_resource(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Delete; an absent object is not an error
    async fn delete_resource(&self, resource: &TrackedResource) -> Result<(), ClusterError>;

    async fn get_tracker(&self, name: &str) -> Result<Option<ResourceTracker>, ClusterError>;

    async fn create_tracker(&self, tracker: &ResourceTracker)
        -> Result<ResourceTracker, ClusterError>;

    /// Replace guarded by `metadata.resourceVersion`
    async fn replace_tracker(
        &self,
        tracker: &ResourceTracker,
    ) -> Result<ResourceTracker, ClusterError>;

    /// Delete; an absent tracker is not an error
    async fn delete_tracker(&self, name: &str) -> Result<(), ClusterError>;

    async fn get_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApplicationRevision>, ClusterError>;

    async fn get_rollout(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AppRollout>, ClusterError>;

    /// Write `metadata.finalizers` guarded by `metadata.resourceVersion`
    async fn update_rollout_finalizers(&self, rollout: &AppRollout)
        -> Result<AppRollout, ClusterError>;

    /// Write the status subresource guarded by `metadata.resourceVersion`
    async fn update_rollout_status(&self, rollout: &AppRollout) -> Result<AppRollout, ClusterError>;
}

fn map_write_error(err: kube::Error, what: String) -> ClusterError {
    match err {
        kube::Error::Api(ref e) if e.code == 409 && e.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists(what)
        }
        kube::Error::Api(ref e) if e.code == 409 => ClusterError::Conflict(what),
        kube::Error::Api(ref e) if e.code == 404 => ClusterError::NotFound(what),
        other => ClusterError::Kube(other),
    }
}

/// Merge patch writing the rollout's status as a whole
///
/// Empty status fields are skipped when serialized; they are sent as `null`
/// so the server drops whatever it stored for them.
pub fn rollout_status_patch(rollout: &AppRollout) -> Result<Value, ClusterError> {
    let mut status = serde_json::to_value(&rollout.status)?;
    if let Value::Object(fields) = &mut status {
        for key in OMITTABLE_STATUS_FIELDS {
            fields.entry(key.to_string()).or_insert(Value::Null);
        }
    }
    Ok(json!({
        "metadata": { "resourceVersion": rollout.resource_version() },
        "status": status,
    }))
}

/// Production cluster access over a `kube::Client`
///
/// API resources of dynamic objects are resolved through discovery and cached
/// per apiVersion/kind.
pub struct KubeCluster {
    client: kube::Client,
    resources: Mutex<HashMap<(String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            resources: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let key = (api_version.to_string(), kind.to_string());
        if let Ok(cache) = self.resources.lock() {
            if let Some(found) = cache.get(&key) {
                return Ok(found.clone());
            }
        }

        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resolved = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClusterError::Discovery(format!("{}/{}", api_version, kind), e.to_string()))?;

        debug!(api_version = %api_version, kind = %kind, plural = %resolved.0.plural, "Resolved API resource");
        if let Ok(mut cache) = self.resources.lock() {
            cache.insert(key, resolved.clone());
        }
        Ok(resolved)
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, caps) = self.resolve(api_version, kind).await?;
        Ok(match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> Result<Api<DynamicObject>, ClusterError> {
        let r = resource_ref(obj)?;
        self.dynamic_api(&r.api_version, &r.kind, r.namespace.as_deref())
            .await
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_resource(
        &self,
        resource: &TrackedResource,
    ) -> Result<Option<DynamicObject>, ClusterError> {
        let api = self
            .dynamic_api(&resource.api_version, &resource.kind, resource.namespace.as_deref())
            .await?;
        Ok(api.get_opt(&resource.name).await?)
    }

    async fn create_resource(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let api = self.api_for_object(obj).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, obj.name_any()))
    }

    async fn replace_resource(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let api = self.api_for_object(obj).await?;
        api.replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, obj.name_any()))
    }

    async fn delete_resource(&self, resource: &TrackedResource) -> Result<(), ClusterError> {
        let api = self
            .dynamic_api(&resource.api_version, &resource.kind, resource.namespace.as_deref())
            .await?;
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_tracker(&self, name: &str) -> Result<Option<ResourceTracker>, ClusterError> {
        let api: Api<ResourceTracker> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_tracker(
        &self,
        tracker: &ResourceTracker,
    ) -> Result<ResourceTracker, ClusterError> {
        let api: Api<ResourceTracker> = Api::all(self.client.clone());
        api.create(&PostParams::default(), tracker)
            .await
            .map_err(|e| map_write_error(e, tracker.name_any()))
    }

    async fn replace_tracker(
        &self,
        tracker: &ResourceTracker,
    ) -> Result<ResourceTracker, ClusterError> {
        let api: Api<ResourceTracker> = Api::all(self.client.clone());
        api.replace(&tracker.name_any(), &PostParams::default(), tracker)
            .await
            .map_err(|e| map_write_error(e, tracker.name_any()))
    }

    async fn delete_tracker(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<ResourceTracker> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_revision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ApplicationRevision>, ClusterError> {
        let api: Api<ApplicationRevision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_rollout(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AppRollout>, ClusterError> {
        let api: Api<AppRollout> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_rollout_finalizers(
        &self,
        rollout: &AppRollout,
    ) -> Result<AppRollout, ClusterError> {
        let namespace = rollout.namespace().unwrap_or_default();
        let api: Api<AppRollout> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": rollout.resource_version(),
                "finalizers": rollout.finalizers(),
            }
        });
        api.patch(&rollout.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(e, rollout.name_any()))
    }

    async fn update_rollout_status(&self, rollout: &AppRollout) -> Result<AppRollout, ClusterError> {
        let namespace = rollout.namespace().unwrap_or_default();
        let api: Api<AppRollout> = Api::namespaced(self.client.clone(), &namespace);
        let patch = rollout_status_patch(rollout)?;
        api.patch_status(&rollout.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(e, rollout.name_any()))
    }
}

#[cfg(test)]
pub use mock::MockCluster;


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::mock::merge_patch;
    use super::*;
    use crate::crd::app_rollout::{
        AppRolloutStatus, RollingState, RolloutCondition, RolloutPlanStatus,
        CONDITION_REVISION_NOT_FOUND,
    };

    fn rollout(status: Option<AppRolloutStatus>) -> AppRollout {
        let mut rollout: AppRollout = serde_json::from_value(json!({
            "apiVersion": "core.oam.dev/v1beta1",
            "kind": "AppRollout",
            "metadata": {"name": "web-rollout", "namespace": "default"},
            "spec": {"targetAppRevisionName": "myapp-v2"}
        }))
        .unwrap();
        rollout.status = status;
        rollout
    }

    fn finished() -> AppRolloutStatus {
        AppRolloutStatus {
            rollout_status: RolloutPlanStatus {
                rolling_state: RollingState::Succeeded,
                current_batch: 2,
                upgraded_replicas: 5,
                rollout_target_size: Some(5),
                conditions: vec![RolloutCondition {
                    type_: CONDITION_REVISION_NOT_FOUND.to_string(),
                    status: "True".to_string(),
                    reason: None,
                    message: None,
                    last_transition_time: None,
                }],
                message: Some("Rolled out 5 replicas".to_string()),
            },
            last_upgraded_target_app_revision: Some("myapp-v2".to_string()),
            last_source_app_revision: Some("myapp-v1".to_string()),
        }
    }

    #[test]
    fn test_status_patch_nulls_cleared_fields() {
        let mut status = finished();
        status.rollout_status.reset();
        status.rollout_status.remove_condition(CONDITION_REVISION_NOT_FOUND);
        status.last_source_app_revision = None;

        let patch = rollout_status_patch(&rollout(Some(status))).unwrap();

        assert_eq!(patch["status"]["rolloutTargetSize"], Value::Null);
        assert_eq!(patch["status"]["conditions"], Value::Null);
        assert_eq!(patch["status"]["message"], Value::Null);
        assert_eq!(patch["status"]["lastSourceAppRevision"], Value::Null);
        assert!(patch["status"]
            .as_object()
            .unwrap()
            .contains_key("lastSourceAppRevision"));
        assert_eq!(patch["status"]["rollingState"], "Initial");
    }

    #[test]
    fn test_status_patch_replaces_stored_status_under_merge() {
        let mut stored = serde_json::to_value(finished()).unwrap();
        let mut desired = finished();
        desired.rollout_status.reset();
        desired.rollout_status.remove_condition(CONDITION_REVISION_NOT_FOUND);
        desired.last_source_app_revision = None;

        let patch = rollout_status_patch(&rollout(Some(desired.clone()))).unwrap();
        merge_patch(&mut stored, &patch["status"]);

        let after: AppRolloutStatus = serde_json::from_value(stored).unwrap();
        assert_eq!(after, desired);
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});

        merge_patch(&mut target, &json!({"a": null, "b": {"c": 4}, "e": [3]}));

        assert_eq!(target, json!({"b": {"c": 4, "d": 3}, "e": [3]}));
    }

    #[tokio::test]
    async fn test_mock_status_write_clears_omitted_fields() {
        let cluster = MockCluster::new();
        let mut stored = cluster.add_rollout(rollout(None));
        stored.status = Some(finished());
        let stored = cluster.update_rollout_status(&stored).await.unwrap();

        let mut next = stored.clone();
        let mut status = finished();
        status.rollout_status.message = None;
        status.last_source_app_revision = None;
        next.status = Some(status.clone());
        cluster.update_rollout_status(&next).await.unwrap();

        let live = cluster.rollout("default", "web-rollout").unwrap();
        assert_eq!(live.status, Some(status));
    }
}
