//! Custom resources consumed and produced by the controller
//!
//! - `ApplicationRevision` - immutable application snapshot (read-only input)
//! - `AppRollout` - user-declared revision transition
//! - `ResourceTracker` - per-revision ledger of dispatched resources

pub mod app_config;
pub mod app_revision;
pub mod app_rollout;
pub mod resource_tracker;

use schemars::{json_schema, JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};

/// API group shared by all kvela resources
pub const API_GROUP: &str = "core.oam.dev";

/// API version of kvela resources (`group/version`)
pub const API_VERSION: &str = "core.oam.dev/v1beta1";

/// Schema for embedded raw documents (`RawExtension` style payloads)
///
/// The structural schema requirement of the API server rejects `{}`, so raw
/// payloads are declared as objects preserving unknown fields.
pub(crate) fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

/// Reference to a typed object by apiVersion/kind/name
///
/// Used for trait→workload references and component scopes. This is a soft
/// reference: it never creates an ownership edge.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct TypedReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub name: String,
}

/// Schema for values that are either an integer or a string such as `"25%"`
pub(crate) fn int_or_string_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "x-kubernetes-int-or-string": true
    })
}
