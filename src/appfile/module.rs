use super::helm::generate_release_and_repository;
use super::{AppfileError, ProcessContext, TemplateEvaluator, Workload};
use crate::controller::labels::{
    LABEL_APP_COMPONENT, LABEL_APP_NAME, LABEL_TRAIT_RESOURCE, LABEL_TRAIT_TYPE,
};
use crate::crd::app_config::{
    ApplicationConfigurationComponent, Component, ComponentScope, ComponentSpec, ComponentTrait,
};
use crate::crd::app_revision::WorkloadGVK;
use crate::crd::TypedReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Component and configuration entry of a chart-based workload
///
/// The component's workload is an empty object of `workload_gvk`; the chart
/// release and repository ride along as the component's chart module. Traits
/// are evaluated against an empty workload output and every assist they
/// produce becomes a trait of the configuration entry.
pub fn generate_component_from_helm_module(
    workload: &Workload,
    app_name: &str,
    namespace: &str,
    workload_gvk: &WorkloadGVK,
    evaluator: &dyn TemplateEvaluator,
) -> Result<(Component, ApplicationConfigurationComponent), AppfileError> {
    let helm = generate_release_and_repository(
        &workload.template,
        &workload.name,
        app_name,
        namespace,
        &workload.params,
    )?;

    let component = Component {
        metadata: ObjectMeta {
            name: Some(workload.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_APP_NAME.to_string(),
                app_name.to_string(),
            )])),
            ..Default::default()
        },
        spec: ComponentSpec {
            workload: json!({
                "apiVersion": workload_gvk.api_version,
                "kind": workload_gvk.kind,
            }),
            helm: Some(helm),
        },
    };

    let context = ProcessContext {
        app_name: app_name.to_string(),
        namespace: namespace.to_string(),
        component: workload.name.clone(),
        output: json!({}),
    };

    let mut traits = Vec::new();
    for workload_trait in &workload.traits {
        let evaluation = evaluator
            .evaluate(&context, workload_trait)
            .map_err(|message| AppfileError::Evaluate {
                trait_name: workload_trait.name.clone(),
                workload: workload.name.clone(),
                message,
            })?;

        for assist in evaluation.assists {
            let Value::Object(mut object) = assist.object else {
                return Err(AppfileError::InvalidAssist {
                    assist: assist.name,
                    component: workload.name.clone(),
                    app: app_name.to_string(),
                });
            };
            let mut labels = BTreeMap::from([
                (LABEL_TRAIT_TYPE, assist.type_name.clone()),
                (LABEL_APP_NAME, app_name.to_string()),
                (LABEL_APP_COMPONENT, workload.name.clone()),
            ]);
            if !assist.name.is_empty() {
                labels.insert(LABEL_TRAIT_RESOURCE, assist.name.clone());
            }
            add_labels(&mut object, labels);
            traits.push(ComponentTrait {
                trait_object: Value::Object(object),
            });
        }
    }

    let scopes = workload
        .scopes
        .iter()
        .map(|scope| ComponentScope {
            scope_ref: TypedReference {
                api_version: scope.api_version.clone(),
                kind: scope.kind.clone(),
                name: scope.name.clone(),
            },
        })
        .collect();

    debug!(
        component = %workload.name,
        app = %app_name,
        traits = traits.len(),
        "Generated component from chart module"
    );

    let entry = ApplicationConfigurationComponent {
        component_name: Some(workload.name.clone()),
        revision_name: None,
        traits,
        scopes,
    };
    Ok((component, entry))
}

/// Add labels to a raw object, overriding existing keys
fn add_labels(object: &mut Map<String, Value>, labels: BTreeMap<&str, String>) {
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| json!({}));
    if !metadata.is_object() {
        *metadata = json!({});
    }
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let existing = metadata.entry("labels").or_insert_with(|| json!({}));
    if !existing.is_object() {
        *existing = json!({});
    }
    if let Some(existing) = existing.as_object_mut() {
        for (key, value) in labels {
            existing.insert(key.to_string(), Value::String(value));
        }
    }
}
