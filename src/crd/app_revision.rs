use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ApplicationRevision is an immutable snapshot of an application's desired state
///
/// Created by the application reconciler once per spec change and never mutated.
/// The controller only reads revisions; several rollouts may reference the same one.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "core.oam.dev",
    version = "v1beta1",
    kind = "ApplicationRevision",
    shortname = "apprev",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ApplicationRevisionSpec {
    /// Raw ApplicationConfiguration document rendered from the application
    #[serde(rename = "applicationConfiguration")]
    #[schemars(schema_with = "crate::crd::raw_object_schema")]
    pub application_configuration: serde_json::Value,

    /// Raw Component documents, one per application component
    #[serde(default)]
    pub components: Vec<RawComponent>,

    /// Component definitions keyed by workload type name
    #[serde(rename = "componentDefinitions", default)]
    pub component_definitions: BTreeMap<String, ComponentDefinition>,

    /// Workload definitions keyed by workload type name
    #[serde(rename = "workloadDefinitions", default)]
    pub workload_definitions: BTreeMap<String, WorkloadDefinition>,

    /// Trait definitions keyed by trait type name
    #[serde(rename = "traitDefinitions", default)]
    pub trait_definitions: BTreeMap<String, TraitDefinition>,
}

/// Wrapper around a raw Component document
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RawComponent {
    #[schemars(schema_with = "crate::crd::raw_object_schema")]
    pub raw: serde_json::Value,
}

/// GroupVersionKind of the resource a definition renders
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct WorkloadGVK {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,
}

/// Describes the workload a component definition produces
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkloadTypeDescriptor {
    /// Name of a WorkloadDefinition
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    /// Inline resource type of the workload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkloadGVK>,
}

/// Reference to the CRD backing a definition
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct DefinitionReference {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Schema and rendering rules of a component type
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ComponentDefinition {
    #[serde(default)]
    pub workload: WorkloadTypeDescriptor,

    /// Rendering template (opaque to the controller)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::raw_object_schema")]
    pub schematic: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkloadDefinition {
    #[serde(rename = "definitionRef")]
    pub definition_ref: DefinitionReference,
}

/// Schema and rendering rules of a trait type
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TraitDefinition {
    /// Field path in the trait where the sibling workload reference is written.
    /// Absent means the trait does not want a reference.
    #[serde(rename = "workloadRefPath", skip_serializing_if = "Option::is_none")]
    pub workload_ref_path: Option<String>,

    /// Workload types this trait may be attached to
    #[serde(rename = "appliesToWorkloads", default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to_workloads: Vec<String>,

    #[serde(rename = "definitionRef", skip_serializing_if = "Option::is_none")]
    pub definition_ref: Option<DefinitionReference>,

    /// Whether applying the trait restarts pods of the workload
    #[serde(rename = "podDisruptive", default)]
    pub pod_disruptive: bool,
}

impl ApplicationRevision {
    /// Content hash recorded by the application reconciler, if any
    pub fn revision_hash(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(crate::controller::labels::LABEL_APP_REVISION_HASH))
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }
}
