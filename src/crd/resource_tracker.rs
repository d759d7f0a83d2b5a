use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ResourceTracker is the ledger of resources dispatched for one application revision
///
/// Cluster-scoped so it can own resources in any namespace. Named
/// `{revision}-{namespace}`; every dispatched resource carries a
/// non-controller owner reference to it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "core.oam.dev",
    version = "v1beta1",
    kind = "ResourceTracker",
    shortname = "rt",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ResourceTrackerSpec {
    #[serde(rename = "trackedResources", default, skip_serializing_if = "Vec::is_empty")]
    pub tracked_resources: Vec<TrackedResource>,
}

/// Identity of a tracked resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub struct TrackedResource {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub name: String,
}

impl ResourceTracker {
    pub fn tracked(&self) -> &[TrackedResource] {
        &self.spec.tracked_resources
    }

    pub fn is_tracking(&self, resource: &TrackedResource) -> bool {
        self.spec.tracked_resources.contains(resource)
    }

    /// Append if not already tracked; returns whether the ledger changed
    pub fn track(&mut self, resource: TrackedResource) -> bool {
        if self.is_tracking(&resource) {
            return false;
        }
        self.spec.tracked_resources.push(resource);
        true
    }

    /// Remove if tracked; returns whether the ledger changed
    pub fn untrack(&mut self, resource: &TrackedResource) -> bool {
        let before = self.spec.tracked_resources.len();
        self.spec.tracked_resources.retain(|r| r != resource);
        before != self.spec.tracked_resources.len()
    }
}

impl std::fmt::Display for TrackedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}
