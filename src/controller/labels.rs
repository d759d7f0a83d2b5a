//! Resource identity and labeling
//!
//! Pure functions computing the canonical names, labels and owner references
//! of workload and trait objects. Everything here is deterministic so that
//! repeated assembly of the same revision produces identical objects.

use crate::crd::resource_tracker::ResourceTracker;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Application name
pub const LABEL_APP_NAME: &str = "app.oam.dev/name";
/// Application revision name
pub const LABEL_APP_REVISION: &str = "app.oam.dev/appRevision";
/// Content hash of the application revision
pub const LABEL_APP_REVISION_HASH: &str = "app.oam.dev/app-revision-hash";
/// Component name
pub const LABEL_APP_COMPONENT: &str = "app.oam.dev/component";
/// Component revision name
pub const LABEL_APP_COMPONENT_REVISION: &str = "app.oam.dev/revision";
/// `WORKLOAD` or `TRAIT`
pub const LABEL_RESOURCE_TYPE: &str = "app.oam.dev/resourceType";
/// Workload type name, set by the renderer
pub const LABEL_WORKLOAD_TYPE: &str = "workload.oam.dev/type";
/// Trait type name, set by the renderer
pub const LABEL_TRAIT_TYPE: &str = "trait.oam.dev/type";
/// Name of the auxiliary resource a trait output was rendered from
pub const LABEL_TRAIT_RESOURCE: &str = "trait.oam.dev/resource";

pub const RESOURCE_TYPE_WORKLOAD: &str = "WORKLOAD";
pub const RESOURCE_TYPE_TRAIT: &str = "TRAIT";

/// Marks a workload as a rollout template (paused until the rollout starts it)
pub const ANNOTATION_ROLLOUT_TEMPLATE: &str = "app.oam.dev/rollout-template";
/// Components rolled by an application-embedded rollout
pub const ANNOTATION_ROLLING_COMPONENTS: &str = "app.oam.dev/rolling-components";
/// Upgrade the workload in place instead of creating a revision-named copy
pub const ANNOTATION_INPLACE_UPGRADE: &str = "app.oam.dev/inplace-upgrade";

/// Control annotations of the application that never reach workloads or traits
pub const CONTROL_ANNOTATIONS: [&str; 3] = [
    ANNOTATION_ROLLOUT_TEMPLATE,
    ANNOTATION_ROLLING_COMPONENTS,
    ANNOTATION_INPLACE_UPGRADE,
];

/// Labels shared by a component's workload and traits
pub fn canonical_labels(
    app_name: &str,
    app_revision: &str,
    revision_hash: &str,
    component: &str,
    component_revision: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP_NAME.to_string(), app_name.to_string()),
        (LABEL_APP_REVISION.to_string(), app_revision.to_string()),
        (LABEL_APP_REVISION_HASH.to_string(), revision_hash.to_string()),
        (LABEL_APP_COMPONENT.to_string(), component.to_string()),
        (
            LABEL_APP_COMPONENT_REVISION.to_string(),
            component_revision.to_string(),
        ),
    ])
}

/// Merge application labels into the canonical set
///
/// Canonical keys are fixed first; application labels only fill keys not
/// already present.
pub fn merge_labels(
    canonical: BTreeMap<String, String>,
    app_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = canonical;
    for (key, value) in app_labels {
        merged
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    merged
}

/// Component name of a component revision name
///
/// Strips a trailing `-v<N>`: `frontend-v3` → `frontend`. Names without a
/// numeric revision suffix are returned unchanged.
pub fn extract_component_name(revision_name: &str) -> &str {
    match revision_name.rsplit_once("-v") {
        Some((name, num))
            if !name.is_empty() && !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => revision_name,
    }
}

/// FNV-1a over arbitrary bytes (stable across processes, unlike SipHash)
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic trait name for traits the renderer left unnamed
///
/// `{component}-{type}-{hash}` where the hash covers the raw trait document.
/// Traits without a type label use `trait` as the middle segment.
pub fn trait_name(component: &str, trait_type: Option<&str>, raw_trait: &serde_json::Value) -> String {
    // serde_json::Value maps are ordered, so serialization is stable
    let raw = raw_trait.to_string();
    let type_segment = trait_type.filter(|t| !t.is_empty()).unwrap_or("trait");
    format!("{}-{}-{:x}", component, type_segment, fnv1a(raw.as_bytes()))
}

/// The controller owner reference of an object, if any
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Non-controller owner reference to a ResourceTracker
///
/// Blocks deletion of the tracker until the owned resource is gone.
pub fn tracker_owner_reference(tracker: &ResourceTracker) -> OwnerReference {
    OwnerReference {
        api_version: ResourceTracker::api_version(&()).to_string(),
        kind: ResourceTracker::kind(&()).to_string(),
        name: tracker.name_any(),
        uid: tracker.uid().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(true),
    }
}

/// Whether an owner reference points at a ResourceTracker
pub fn is_tracker_owner(owner: &OwnerReference) -> bool {
    owner.kind == ResourceTracker::kind(&()) && owner.api_version == ResourceTracker::api_version(&())
}

/// Name of the tracker for a revision dispatched into a namespace
pub fn resource_tracker_name(revision: &str, namespace: &str) -> String {
    format!("{}-{}", revision, namespace)
}
