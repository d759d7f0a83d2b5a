//! Dispatch of assembled manifests with ownership-aware garbage collection
//!
//! Every dispatched resource is recorded in the ResourceTracker of the
//! revision it was dispatched for, and carries a non-controller owner
//! reference to that tracker. A resource has at most one tracker owner.
//!
//! Two optional modes:
//! - upgrade (adopt): resources tracked by a source revision's tracker are
//!   moved to the current tracker; nothing is deleted
//! - GC: resources tracked by a prior tracker that are not part of the new
//!   manifest set are deleted, and the prior tracker is deleted once empty

use crate::controller::cluster::{resource_ref, ClusterClient, ClusterError};
use crate::controller::labels::{is_tracker_owner, resource_tracker_name, tracker_owner_reference};
use crate::crd::app_revision::ApplicationRevision;
use crate::crd::resource_tracker::{ResourceTracker, ResourceTrackerSpec, TrackedResource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts of a write before a conflict is reported
pub const DEFAULT_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot apply {resource}: {source}")]
    Apply {
        resource: TrackedResource,
        #[source]
        source: ClusterError,
    },

    #[error("cannot delete {resource}: {source}")]
    Delete {
        resource: TrackedResource,
        #[source]
        source: ClusterError,
    },

    #[error("cannot update resource tracker {name}: {source}")]
    Tracker {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("gave up writing {0} after {1} conflicting attempts")]
    ConflictRetriesExhausted(String, usize),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Applies manifests of one application revision
pub struct Dispatcher {
    cluster: Arc<dyn ClusterClient>,
    tracker_name: String,
    upgrade_from: Option<String>,
    gc_from: Option<String>,
    conflict_retries: usize,
}

impl Dispatcher {
    /// Dispatcher for the tracker of `revision`
    pub fn new(cluster: Arc<dyn ClusterClient>, revision: &ApplicationRevision) -> Self {
        let tracker_name =
            resource_tracker_name(&revision.name_any(), &revision.namespace().unwrap_or_default());
        Self::with_tracker(cluster, tracker_name)
    }

    pub fn with_tracker(cluster: Arc<dyn ClusterClient>, tracker_name: String) -> Self {
        Self {
            cluster,
            tracker_name,
            upgrade_from: None,
            gc_from: None,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Adopt resources tracked by `source_tracker` instead of recreating them
    pub fn enable_upgrade_and_skip_gc(mut self, source_tracker: impl Into<String>) -> Self {
        self.upgrade_from = Some(source_tracker.into());
        self
    }

    /// Delete resources tracked by `prior_tracker` that are no longer dispatched
    pub fn enable_gc(mut self, prior_tracker: impl Into<String>) -> Self {
        self.gc_from = Some(prior_tracker.into());
        self
    }

    pub fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = retries.max(1);
        self
    }

    pub fn tracker_name(&self) -> &str {
        &self.tracker_name
    }

    /// Apply `manifests` in order and return the applied identities
    ///
    /// Applied identities are recorded in the current tracker before
    /// returning, including those applied before a failure.
    pub async fn dispatch(
        &self,
        manifests: &[DynamicObject],
    ) -> Result<Vec<TrackedResource>, DispatchError> {
        let current = self.get_or_create_tracker().await?;
        let previously_tracked: Vec<TrackedResource> = current.tracked().to_vec();
        let owner = tracker_owner_reference(&current);

        let mut applied = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            match self.apply(manifest, &owner).await {
                Ok(resource) => applied.push(resource),
                Err(e) => {
                    if let Err(persist) = self.update_tracker(&self.tracker_name, &applied, &[]).await {
                        warn!(tracker = %self.tracker_name, error = %persist, "Failed to record partial dispatch progress");
                    }
                    return Err(e);
                }
            }
        }

        self.update_tracker(&self.tracker_name, &applied, &[]).await?;
        info!(tracker = %self.tracker_name, resources = applied.len(), "Dispatched manifests");

        if let Some(source) = &self.upgrade_from {
            if source != &self.tracker_name {
                self.adopt(source, &applied).await?;
            }
        }

        if let Some(prior) = &self.gc_from {
            if prior == &self.tracker_name {
                self.prune_in_place(&previously_tracked, &applied).await?;
            } else {
                self.collect_garbage(prior, &applied).await?;
            }
        }

        Ok(applied)
    }

    async fn get_or_create_tracker(&self) -> Result<ResourceTracker, DispatchError> {
        let tracker_err = |source| DispatchError::Tracker {
            name: self.tracker_name.clone(),
            source,
        };

        if let Some(existing) = self.cluster.get_tracker(&self.tracker_name).await.map_err(tracker_err)? {
            return Ok(existing);
        }
        let tracker = ResourceTracker::new(&self.tracker_name, ResourceTrackerSpec::default());
        match self.cluster.create_tracker(&tracker).await {
            Ok(created) => {
                debug!(tracker = %self.tracker_name, "Created resource tracker");
                Ok(created)
            }
            Err(ClusterError::AlreadyExists(_)) => self
                .cluster
                .get_tracker(&self.tracker_name)
                .await
                .map_err(tracker_err)?
                .ok_or_else(|| tracker_err(ClusterError::NotFound(self.tracker_name.clone()))),
            Err(e) => Err(tracker_err(e)),
        }
    }

    /// Create-or-replace one manifest, retrying on conflict
    async fn apply(
        &self,
        manifest: &DynamicObject,
        owner: &OwnerReference,
    ) -> Result<TrackedResource, DispatchError> {
        let resource = resource_ref(manifest)?;
        let apply_err = |source| DispatchError::Apply {
            resource: resource.clone(),
            source,
        };

        let mut desired = manifest.clone();
        set_tracker_owner(&mut desired, owner);

        for attempt in 1..=self.conflict_retries {
            let live = self.cluster.get_resource(&resource).await.map_err(apply_err)?;
            let result = match live {
                None => self.cluster.create_resource(&desired).await.map(|_| ()),
                Some(live) => {
                    let merged = merge_with_live(&desired, &live);
                    if is_up_to_date(&merged, &live) {
                        return Ok(resource);
                    }
                    self.cluster.replace_resource(&merged).await.map(|_| ())
                }
            };
            match result {
                Ok(()) => {
                    debug!(resource = %resource, "Applied resource");
                    return Ok(resource);
                }
                Err(e) if e.is_conflict() || matches!(e, ClusterError::AlreadyExists(_)) => {
                    debug!(resource = %resource, attempt, "Conflict applying resource, retrying");
                }
                Err(e) => return Err(apply_err(e)),
            }
        }
        Err(DispatchError::ConflictRetriesExhausted(
            resource.to_string(),
            self.conflict_retries,
        ))
    }

    async fn adopt(&self, source: &str, applied: &[TrackedResource]) -> Result<(), DispatchError> {
        let Some(source_tracker) = self.get_tracker(source).await? else {
            return Ok(());
        };
        let adopted: Vec<TrackedResource> = applied
            .iter()
            .filter(|r| source_tracker.is_tracking(r))
            .cloned()
            .collect();
        if adopted.is_empty() {
            return Ok(());
        }
        self.update_tracker(source, &[], &adopted).await?;
        info!(source = %source, tracker = %self.tracker_name, adopted = adopted.len(), "Adopted resources");
        Ok(())
    }

    async fn collect_garbage(
        &self,
        prior: &str,
        applied: &[TrackedResource],
    ) -> Result<(), DispatchError> {
        let Some(prior_tracker) = self.get_tracker(prior).await? else {
            debug!(prior = %prior, "Prior resource tracker already gone");
            return Ok(());
        };
        let keep: BTreeSet<&TrackedResource> = applied.iter().collect();
        let mut handled = Vec::new();

        for resource in prior_tracker.tracked() {
            if !keep.contains(resource) {
                if let Err(e) = self.delete_unless_owned_elsewhere(resource, prior).await {
                    self.update_tracker(prior, &[], &handled).await?;
                    return Err(e);
                }
            }
            handled.push(resource.clone());
        }

        let Some(remaining) = self.update_tracker(prior, &[], &handled).await? else {
            return Ok(());
        };
        if remaining.tracked().is_empty() {
            self.cluster
                .delete_tracker(prior)
                .await
                .map_err(|source| DispatchError::Tracker {
                    name: prior.to_string(),
                    source,
                })?;
            info!(prior = %prior, "Deleted empty resource tracker");
        }
        Ok(())
    }

    async fn prune_in_place(
        &self,
        previously_tracked: &[TrackedResource],
        applied: &[TrackedResource],
    ) -> Result<(), DispatchError> {
        let keep: BTreeSet<&TrackedResource> = applied.iter().collect();
        let mut pruned = Vec::new();

        for resource in previously_tracked.iter().filter(|r| !keep.contains(r)) {
            if let Err(e) = self
                .delete_unless_owned_elsewhere(resource, &self.tracker_name)
                .await
            {
                self.update_tracker(&self.tracker_name, &[], &pruned).await?;
                return Err(e);
            }
            pruned.push(resource.clone());
        }
        if !pruned.is_empty() {
            self.update_tracker(&self.tracker_name, &[], &pruned).await?;
            info!(tracker = %self.tracker_name, pruned = pruned.len(), "Pruned stale resources");
        }
        Ok(())
    }

    /// Delete a stale resource unless another tracker has taken it over
    async fn delete_unless_owned_elsewhere(
        &self,
        resource: &TrackedResource,
        tracker: &str,
    ) -> Result<(), DispatchError> {
        let delete_err = |source| DispatchError::Delete {
            resource: resource.clone(),
            source,
        };
        let Some(live) = self.cluster.get_resource(resource).await.map_err(delete_err)? else {
            return Ok(());
        };
        let owned_elsewhere = live
            .owner_references()
            .iter()
            .any(|o| is_tracker_owner(o) && o.name != tracker);
        if owned_elsewhere {
            debug!(resource = %resource, "Resource owned by another tracker, skipping deletion");
            return Ok(());
        }
        self.cluster.delete_resource(resource).await.map_err(delete_err)?;
        info!(resource = %resource, "Garbage collected resource");
        Ok(())
    }

    async fn get_tracker(&self, name: &str) -> Result<Option<ResourceTracker>, DispatchError> {
        self.cluster
            .get_tracker(name)
            .await
            .map_err(|source| DispatchError::Tracker {
                name: name.to_string(),
                source,
            })
    }

    /// Add and remove ledger entries of a tracker against a fresh read
    ///
    /// Returns the tracker as written, or `None` when it does not exist and
    /// there is nothing to add.
    async fn update_tracker(
        &self,
        name: &str,
        add: &[TrackedResource],
        remove: &[TrackedResource],
    ) -> Result<Option<ResourceTracker>, DispatchError> {
        let tracker_err = |source| DispatchError::Tracker {
            name: name.to_string(),
            source,
        };

        for _ in 0..self.conflict_retries {
            let Some(mut tracker) = self.cluster.get_tracker(name).await.map_err(tracker_err)? else {
                if add.is_empty() {
                    return Ok(None);
                }
                let mut tracker = ResourceTracker::new(name, ResourceTrackerSpec::default());
                for r in add {
                    tracker.track(r.clone());
                }
                match self.cluster.create_tracker(&tracker).await {
                    Ok(created) => return Ok(Some(created)),
                    Err(ClusterError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(tracker_err(e)),
                }
            };

            let mut changed = false;
            for r in add {
                changed |= tracker.track(r.clone());
            }
            for r in remove {
                changed |= tracker.untrack(r);
            }
            if !changed {
                return Ok(Some(tracker));
            }
            match self.cluster.replace_tracker(&tracker).await {
                Ok(written) => return Ok(Some(written)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(tracker_err(e)),
            }
        }
        Err(DispatchError::ConflictRetriesExhausted(
            format!("ResourceTracker {}", name),
            self.conflict_retries,
        ))
    }
}

/// Replace tracker owner references with the current tracker
fn set_tracker_owner(obj: &mut DynamicObject, owner: &OwnerReference) {
    let owners = obj.owner_references_mut();
    owners.retain(|o| !is_tracker_owner(o));
    owners.push(owner.clone());
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.kind == b.kind && a.name == b.name && a.api_version == b.api_version
}

/// Desired object carrying the live object's version, finalizers and
/// foreign owner references
fn merge_with_live(desired: &DynamicObject, live: &DynamicObject) -> DynamicObject {
    let mut merged = desired.clone();
    merged.metadata.resource_version = live.metadata.resource_version.clone();
    merged.metadata.uid = live.metadata.uid.clone();
    merged.metadata.finalizers = live.metadata.finalizers.clone();

    let foreign: Vec<OwnerReference> = live
        .owner_references()
        .iter()
        .filter(|o| !is_tracker_owner(o))
        .filter(|o| !desired.owner_references().iter().any(|d| same_owner(d, o)))
        .cloned()
        .collect();
    if !foreign.is_empty() {
        merged.owner_references_mut().extend(foreign);
    }
    merged
}

/// Whether writing `merged` would change anything on `live`
fn is_up_to_date(merged: &DynamicObject, live: &DynamicObject) -> bool {
    merged.data == live.data
        && merged.labels() == live.labels()
        && merged.annotations() == live.annotations()
        && merged.owner_references() == live.owner_references()
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
