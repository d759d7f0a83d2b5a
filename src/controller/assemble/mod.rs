//! Assembly of an ApplicationRevision into concrete manifests
//!
//! Assembling completes the workload and trait objects recorded in a revision
//! so they are ready to be dispatched into the cluster:
//!
//! 1. the workload is named after its component
//! 2. the application namespace is used when the object has none
//! 3. the application becomes the sole controller owner
//! 4. canonical and application labels plus application annotations are applied
//! 5. traits receive a reference to their sibling workload when their
//!    definition declares a `workloadRefPath`
//!
//! Workload options are applied after these rules.

pub mod fieldpath;
pub mod options;

pub use options::WorkloadOption;

use crate::controller::labels::{
    canonical_labels, controller_owner, extract_component_name, merge_labels, trait_name,
    CONTROL_ANNOTATIONS, LABEL_RESOURCE_TYPE, LABEL_TRAIT_TYPE, LABEL_WORKLOAD_TYPE,
    RESOURCE_TYPE_TRAIT, RESOURCE_TYPE_WORKLOAD,
};
use crate::crd::app_config::{ApplicationConfiguration, Component};
use crate::crd::app_revision::ApplicationRevision;
use crate::crd::TypedReference;
use fieldpath::FieldPathError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("cannot assemble application revision {revision}: {reason}")]
    Precondition { revision: String, reason: String },

    #[error("cannot decode {what} of component {component:?}: {reason}")]
    Decode {
        component: String,
        what: String,
        reason: String,
    },

    #[error("cannot apply workload option {option:?} for component {component:?}: {reason}")]
    WorkloadOption {
        component: String,
        option: WorkloadOption,
        reason: String,
    },

    #[error("cannot set workload reference to trait {trait_name:?} of component {component:?}: {source}")]
    WorkloadRef {
        component: String,
        trait_name: String,
        #[source]
        source: FieldPathError,
    },

    #[error("component {0:?} is not recorded in the application revision")]
    ComponentNotFound(String),
}

impl AssembleError {
    /// Precondition failures will not succeed on retry
    pub fn is_precondition(&self) -> bool {
        matches!(self, AssembleError::Precondition { .. })
    }
}

/// Manifests of one component
#[derive(Debug, Clone)]
pub struct AssembledComponent {
    pub name: String,
    pub workload: DynamicObject,
    /// Traits in declaration order
    pub traits: Vec<DynamicObject>,
    /// Chart release and repository of chart-based components
    pub auxiliaries: Vec<DynamicObject>,
    pub scopes: Vec<TypedReference>,
}

/// Assembled manifests in application configuration order
#[derive(Debug, Clone, Default)]
pub struct AssembledManifests {
    components: Vec<AssembledComponent>,
}

impl AssembledManifests {
    pub fn components(&self) -> &[AssembledComponent] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<&AssembledComponent> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn workload(&self, component: &str) -> Option<&DynamicObject> {
        self.component(component).map(|c| &c.workload)
    }

    pub fn traits(&self, component: &str) -> Option<&[DynamicObject]> {
        self.component(component).map(|c| c.traits.as_slice())
    }

    pub fn scopes(&self, component: &str) -> Option<&[TypedReference]> {
        self.component(component).map(|c| c.scopes.as_slice())
    }

    /// Workload of the first component
    pub fn primary_workload(&self) -> Option<&DynamicObject> {
        self.components.first().map(|c| &c.workload)
    }

    /// Flattened manifest list: per component the workload, then its traits,
    /// then its auxiliary objects
    pub fn manifests(&self) -> Vec<DynamicObject> {
        self.components
            .iter()
            .flat_map(|c| {
                std::iter::once(c.workload.clone())
                    .chain(c.traits.iter().cloned())
                    .chain(c.auxiliaries.iter().cloned())
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Application metadata read from the embedded application configuration
struct AppContext<'a> {
    revision: &'a ApplicationRevision,
    revision_name: String,
    revision_hash: String,
    app_name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    owner: OwnerReference,
}

/// Assemble the manifests of an application revision
///
/// Any failure aborts the whole call; no partial result is returned.
pub fn assemble(
    revision: &ApplicationRevision,
    options: &[WorkloadOption],
) -> Result<AssembledManifests, AssembleError> {
    let revision_name = revision.name_any();
    let precondition = |reason: String| AssembleError::Precondition {
        revision: revision_name.clone(),
        reason,
    };

    let app_config: ApplicationConfiguration =
        serde_json::from_value(revision.spec.application_configuration.clone())
            .map_err(|e| precondition(format!("undecodable application configuration: {}", e)))?;

    let owner = controller_owner(&app_config.metadata)
        .cloned()
        .ok_or_else(|| precondition("application revision must have an Application as owner".into()))?;
    let revision_hash = revision
        .revision_hash()
        .ok_or_else(|| precondition("application revision must record its revision hash in a label".into()))?
        .to_string();

    let components = decode_components(revision)?;

    let ctx = AppContext {
        revision,
        revision_name: revision_name.clone(),
        revision_hash,
        app_name: app_config.metadata.name.clone().unwrap_or_default(),
        namespace: app_config.metadata.namespace.clone(),
        labels: app_config.metadata.labels.clone().unwrap_or_default(),
        annotations: app_config.metadata.annotations.clone().unwrap_or_default(),
        owner,
    };

    let mut assembled = Vec::with_capacity(app_config.spec.components.len());
    for (index, acc) in app_config.spec.components.iter().enumerate() {
        let component_revision = acc
            .revision_or_name()
            .ok_or_else(|| {
                precondition(format!(
                    "component entry {} has neither componentName nor revisionName",
                    index
                ))
            })?
            .to_string();
        let component_name = match acc.revision_name.as_deref().filter(|r| !r.is_empty()) {
            Some(rev) => extract_component_name(rev).to_string(),
            None => component_revision.clone(),
        };
        let common = merge_labels(
            canonical_labels(
                &ctx.app_name,
                &ctx.revision_name,
                &ctx.revision_hash,
                &component_name,
                &component_revision,
            ),
            &ctx.labels,
        );

        let component = components
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(component_name.as_str()))
            .ok_or_else(|| AssembleError::ComponentNotFound(component_name.clone()))?;

        let workload = assemble_workload(&ctx, component, &component_name, &common, options)?;
        let workload_ref = TypedReference {
            api_version: workload.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
            kind: workload.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
            name: workload.name_any(),
        };

        let mut traits = Vec::with_capacity(acc.traits.len());
        for (i, component_trait) in acc.traits.iter().enumerate() {
            traits.push(assemble_trait(
                &ctx,
                &component_trait.trait_object,
                i,
                &component_name,
                &common,
                &workload_ref,
            )?);
        }

        let auxiliaries = match &component.spec.helm {
            Some(helm) => vec![
                assemble_auxiliary(&ctx, &helm.repository, "helm repository", &component_name, &common)?,
                assemble_auxiliary(&ctx, &helm.release, "helm release", &component_name, &common)?,
            ],
            None => Vec::new(),
        };

        debug!(
            revision = %ctx.revision_name,
            component = %component_name,
            workload = %workload.name_any(),
            traits = traits.len(),
            "Assembled component"
        );

        assembled.push(AssembledComponent {
            name: component_name,
            workload,
            traits,
            auxiliaries,
            scopes: acc.scopes.iter().map(|s| s.scope_ref.clone()).collect(),
        });
    }

    Ok(AssembledManifests {
        components: assembled,
    })
}

fn decode_components(revision: &ApplicationRevision) -> Result<Vec<Component>, AssembleError> {
    revision
        .spec
        .components
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_value::<Component>(raw.raw.clone()).map_err(|e| AssembleError::Decode {
                component: format!("#{}", i),
                what: "component document".to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Decode a raw embedded object into a `DynamicObject`
fn decode_object(raw: &Value, component: &str, what: &str) -> Result<DynamicObject, AssembleError> {
    let decode_err = |reason: String| AssembleError::Decode {
        component: component.to_string(),
        what: what.to_string(),
        reason,
    };

    let mut raw = raw.clone();
    let body = raw
        .as_object_mut()
        .ok_or_else(|| decode_err("not an object".to_string()))?;
    body.entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));

    let obj: DynamicObject = serde_json::from_value(raw).map_err(|e| decode_err(e.to_string()))?;
    match &obj.types {
        Some(t) if !t.api_version.is_empty() && !t.kind.is_empty() => Ok(obj),
        _ => Err(decode_err("missing apiVersion or kind".to_string())),
    }
}

fn assemble_workload(
    ctx: &AppContext<'_>,
    component: &Component,
    component_name: &str,
    common: &BTreeMap<String, String>,
    options: &[WorkloadOption],
) -> Result<DynamicObject, AssembleError> {
    let mut workload = decode_object(&component.spec.workload, component_name, "workload")?;

    // Overrides any name set while rendering
    workload.metadata.name = Some(component_name.to_string());
    set_labels(&mut workload, common, RESOURCE_TYPE_WORKLOAD);
    set_common_fields(ctx, &mut workload);

    let workload_type = workload.labels().get(LABEL_WORKLOAD_TYPE).cloned();
    let definition = workload_type
        .as_deref()
        .and_then(|t| ctx.revision.spec.component_definitions.get(t));
    for option in options {
        option
            .apply(&mut workload, component, definition)
            .map_err(|reason| AssembleError::WorkloadOption {
                component: component_name.to_string(),
                option: *option,
                reason,
            })?;
    }
    Ok(workload)
}

fn assemble_trait(
    ctx: &AppContext<'_>,
    raw: &Value,
    index: usize,
    component_name: &str,
    common: &BTreeMap<String, String>,
    workload_ref: &TypedReference,
) -> Result<DynamicObject, AssembleError> {
    let mut object = decode_object(raw, component_name, &format!("trait #{}", index))?;
    let trait_type = object.labels().get(LABEL_TRAIT_TYPE).cloned();

    // Names chosen while rendering are kept
    if object.metadata.name.as_deref().unwrap_or_default().is_empty() {
        object.metadata.name = Some(trait_name(component_name, trait_type.as_deref(), raw));
    }
    set_labels(&mut object, common, RESOURCE_TYPE_TRAIT);
    set_common_fields(ctx, &mut object);

    let ref_path = trait_type
        .as_deref()
        .and_then(|t| ctx.revision.spec.trait_definitions.get(t))
        .and_then(|d| d.workload_ref_path.as_deref())
        .filter(|p| !p.is_empty());
    if let Some(path) = ref_path {
        let reference = serde_json::to_value(workload_ref).map_err(|e| AssembleError::Decode {
            component: component_name.to_string(),
            what: "workload reference".to_string(),
            reason: e.to_string(),
        })?;
        fieldpath::set_value(&mut object.data, path, reference).map_err(|source| {
            AssembleError::WorkloadRef {
                component: component_name.to_string(),
                trait_name: object.name_any(),
                source,
            }
        })?;
    }
    Ok(object)
}

fn assemble_auxiliary(
    ctx: &AppContext<'_>,
    raw: &Value,
    what: &str,
    component_name: &str,
    common: &BTreeMap<String, String>,
) -> Result<DynamicObject, AssembleError> {
    let mut object = decode_object(raw, component_name, what)?;
    set_labels(&mut object, common, RESOURCE_TYPE_TRAIT);
    set_common_fields(ctx, &mut object);
    Ok(object)
}

/// Resource type label plus the component's common labels, overriding
/// labels of the same key already on the object
fn set_labels(obj: &mut DynamicObject, common: &BTreeMap<String, String>, resource_type: &str) {
    let labels = obj.labels_mut();
    labels.insert(LABEL_RESOURCE_TYPE.to_string(), resource_type.to_string());
    labels.extend(common.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Annotations, namespace and controller owner shared by workloads and traits
fn set_common_fields(ctx: &AppContext<'_>, obj: &mut DynamicObject) {
    let annotations = obj.annotations_mut();
    annotations.extend(ctx.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    for key in CONTROL_ANNOTATIONS {
        annotations.remove(key);
    }
    if obj.metadata.annotations.as_ref().is_some_and(|a| a.is_empty()) {
        obj.metadata.annotations = None;
    }

    if obj.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        obj.metadata.namespace = ctx.namespace.clone();
    }
    obj.metadata.owner_references = Some(vec![ctx.owner.clone()]);
}

#[cfg(test)]
#[path = "assemble_test.rs"]
mod tests;
