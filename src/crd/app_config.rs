//! Payload documents embedded in an ApplicationRevision
//!
//! These are not served as custom resources by this controller; they are the
//! decoded form of the raw `applicationConfiguration` and `components` entries.

use super::TypedReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Application configuration rendered from an Application
///
/// Its metadata carries the application's name, namespace, labels, annotations
/// and the Application controller owner reference.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ApplicationConfiguration {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ApplicationConfigurationSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ApplicationConfigurationSpec {
    #[serde(default)]
    pub components: Vec<ApplicationConfigurationComponent>,
}

/// One component entry of the application configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ApplicationConfigurationComponent {
    /// Component name (used when no revision is pinned)
    #[serde(rename = "componentName", skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,

    /// Immutable component revision name, e.g. `frontend-v3`
    #[serde(rename = "revisionName", skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    /// Rendered traits in declaration order
    #[serde(default)]
    pub traits: Vec<ComponentTrait>,

    #[serde(default)]
    pub scopes: Vec<ComponentScope>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ComponentTrait {
    /// Raw rendered trait object
    #[serde(rename = "trait")]
    pub trait_object: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ComponentScope {
    #[serde(rename = "scopeRef")]
    pub scope_ref: TypedReference,
}

/// Component document holding the rendered workload
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Component {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ComponentSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ComponentSpec {
    /// Raw rendered workload object
    #[serde(default)]
    pub workload: serde_json::Value,

    /// Chart-based module resources, when the workload comes from a chart
    #[serde(rename = "helm", skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmModuleResource>,
}

/// Chart release and repository objects of a chart-based component
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HelmModuleResource {
    pub release: serde_json::Value,

    pub repository: serde_json::Value,
}

impl ApplicationConfigurationComponent {
    /// Revision name used for the component revision label
    ///
    /// Falls back to the component name when no revision is pinned.
    pub fn revision_or_name(&self) -> Option<&str> {
        self.revision_name
            .as_deref()
            .filter(|r| !r.is_empty())
            .or(self.component_name.as_deref())
    }
}
