use crate::controller::labels::{
    ANNOTATION_INPLACE_UPGRADE, ANNOTATION_ROLLOUT_TEMPLATE, LABEL_APP_COMPONENT_REVISION,
};
use crate::crd::app_config::Component;
use crate::crd::app_revision::ComponentDefinition;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};

/// Adjustments applied to a workload after the generic assembly rules
///
/// Options are folded over each workload in the order given to
/// [`super::assemble`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOption {
    /// Name the workload after its immutable component revision (`web-v3`)
    /// so that the source and target of a rollout can coexist
    NameByComponentRevision,
    /// Pause the workload so the rollout controls when it progresses and
    /// mark it as a rollout template
    PrepareForRollout,
    /// Name the workload after the component so it is upgraded in place
    PrepareForInplaceUpgrade,
}

impl WorkloadOption {
    pub fn apply(
        &self,
        workload: &mut DynamicObject,
        component: &Component,
        _definition: Option<&ComponentDefinition>,
    ) -> Result<(), String> {
        match self {
            WorkloadOption::NameByComponentRevision => {
                let revision = workload
                    .labels()
                    .get(LABEL_APP_COMPONENT_REVISION)
                    .filter(|r| !r.is_empty())
                    .cloned()
                    .ok_or_else(|| format!("missing {} label", LABEL_APP_COMPONENT_REVISION))?;
                workload.metadata.name = Some(revision);
            }
            WorkloadOption::PrepareForRollout => {
                pause_workload(workload)?;
                workload
                    .annotations_mut()
                    .insert(ANNOTATION_ROLLOUT_TEMPLATE.to_string(), "true".to_string());
            }
            WorkloadOption::PrepareForInplaceUpgrade => {
                let name = component
                    .metadata
                    .name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| "component has no name".to_string())?;
                workload.metadata.name = Some(name);
                workload
                    .annotations_mut()
                    .insert(ANNOTATION_INPLACE_UPGRADE.to_string(), "true".to_string());
            }
        }
        Ok(())
    }
}

/// Set the pause switch of workload kinds that have one
///
/// Deployments pause through `spec.paused`; kinds with an update strategy
/// (e.g. CloneSet) through `spec.updateStrategy.paused`. Other kinds are
/// left as they are.
fn pause_workload(workload: &mut DynamicObject) -> Result<(), String> {
    let kind = workload.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    let data = &mut workload.data;
    if data.is_null() {
        *data = Value::Object(Map::new());
    }
    let root = data
        .as_object_mut()
        .ok_or_else(|| "workload body is not an object".to_string())?;
    let spec = root
        .entry("spec")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| "workload spec is not an object".to_string())?;

    if kind == "Deployment" {
        spec.insert("paused".to_string(), Value::Bool(true));
    } else if kind == "CloneSet" || spec.contains_key("updateStrategy") {
        spec.entry("updateStrategy")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| "workload updateStrategy is not an object".to_string())?
            .insert("paused".to_string(), Value::Bool(true));
    }
    Ok(())
}
