#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::controller::labels::{
    ANNOTATION_ROLLOUT_TEMPLATE, LABEL_APP_COMPONENT, LABEL_APP_COMPONENT_REVISION,
    LABEL_APP_NAME, LABEL_APP_REVISION, LABEL_APP_REVISION_HASH,
};
use serde_json::json;

const APP_REVISION: &str = include_str!("testdata/apprevision.yaml");

fn revision() -> ApplicationRevision {
    serde_yaml::from_str(APP_REVISION).expect("Failed to parse testdata")
}

#[test]
fn test_assemble_workload_identity() {
    let manifests = assemble(&revision(), &[]).unwrap();

    let names: Vec<_> = manifests.components().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["web", "worker"]);

    let web = manifests.workload("web").unwrap();
    // Rendered name is overridden with the component name
    assert_eq!(web.name_any(), "web");
    assert_eq!(web.namespace().as_deref(), Some("default"));

    let labels = web.labels();
    assert_eq!(labels[LABEL_APP_NAME], "myapp");
    assert_eq!(labels[LABEL_APP_REVISION], "myapp-v2");
    assert_eq!(labels[LABEL_APP_REVISION_HASH], "ce053923e2fb403f");
    assert_eq!(labels[LABEL_APP_COMPONENT], "web");
    assert_eq!(labels[LABEL_APP_COMPONENT_REVISION], "web-v2");
    assert_eq!(labels[LABEL_RESOURCE_TYPE], RESOURCE_TYPE_WORKLOAD);
    assert_eq!(labels[LABEL_WORKLOAD_TYPE], "webservice");
    assert_eq!(labels["team"], "payments");

    let owners = web.owner_references();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "Application");
    assert_eq!(owners[0].name, "myapp");
    assert_eq!(owners[0].controller, Some(true));
}

#[test]
fn test_assemble_strips_control_annotations() {
    let manifests = assemble(&revision(), &[]).unwrap();

    for obj in manifests.manifests() {
        let annotations = obj.annotations();
        assert_eq!(annotations.get("owner").map(String::as_str), Some("alice"));
        for key in CONTROL_ANNOTATIONS {
            assert!(!annotations.contains_key(key), "{} kept on {}", key, obj.name_any());
        }
    }
}

#[test]
fn test_assemble_keeps_explicit_namespace() {
    let manifests = assemble(&revision(), &[]).unwrap();

    let worker = manifests.workload("worker").unwrap();
    assert_eq!(worker.namespace().as_deref(), Some("jobs"));
    // componentName entries use the component name as revision label
    assert_eq!(worker.labels()[LABEL_APP_COMPONENT_REVISION], "worker");
}

#[test]
fn test_assemble_trait_names() {
    let manifests = assemble(&revision(), &[]).unwrap();
    let traits = manifests.traits("web").unwrap();

    assert_eq!(traits.len(), 2);
    // Unnamed trait gets a generated name
    assert!(traits[0].name_any().starts_with("web-expose-"));
    // Rendered name is kept
    assert_eq!(traits[1].name_any(), "web-scaler");

    for t in traits {
        assert_eq!(t.labels()[LABEL_RESOURCE_TYPE], RESOURCE_TYPE_TRAIT);
        assert_eq!(t.labels()[LABEL_APP_COMPONENT], "web");
        assert_eq!(t.owner_references()[0].name, "myapp");
    }
}

#[test]
fn test_workload_ref_only_with_declared_path() {
    let manifests = assemble(&revision(), &[]).unwrap();
    let traits = manifests.traits("web").unwrap();

    // expose has no workloadRefPath
    assert!(traits[0].data["spec"].get("workloadRef").is_none());

    assert_eq!(
        traits[1].data["spec"]["workloadRef"],
        json!({"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"})
    );
    assert_eq!(traits[1].data["spec"]["replicaCount"], 3);
}

#[test]
fn test_workload_ref_follows_revision_naming() {
    let manifests = assemble(&revision(), &[WorkloadOption::NameByComponentRevision]).unwrap();

    assert_eq!(manifests.workload("web").unwrap().name_any(), "web-v2");
    let scaler = &manifests.traits("web").unwrap()[1];
    assert_eq!(scaler.data["spec"]["workloadRef"]["name"], "web-v2");
}

#[test]
fn test_prepare_for_rollout_pauses_deployment() {
    let manifests = assemble(&revision(), &[WorkloadOption::PrepareForRollout]).unwrap();

    let web = manifests.workload("web").unwrap();
    assert_eq!(web.data["spec"]["paused"], true);
    assert_eq!(
        web.annotations().get(ANNOTATION_ROLLOUT_TEMPLATE).map(String::as_str),
        Some("true")
    );
}

#[test]
fn test_prepare_for_inplace_upgrade_resets_name() {
    let options = [
        WorkloadOption::NameByComponentRevision,
        WorkloadOption::PrepareForInplaceUpgrade,
    ];
    let manifests = assemble(&revision(), &options).unwrap();

    assert_eq!(manifests.workload("web").unwrap().name_any(), "web");
}

#[test]
fn test_scopes_copied_in_order() {
    let manifests = assemble(&revision(), &[]).unwrap();

    let scopes = manifests.scopes("web").unwrap();
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].kind, "HealthScope");
    assert_eq!(scopes[0].name, "myapp-health");
    assert!(manifests.scopes("worker").unwrap().is_empty());
}

#[test]
fn test_manifests_order() {
    let manifests = assemble(&revision(), &[]).unwrap();

    let kinds: Vec<_> = manifests
        .manifests()
        .iter()
        .map(|m| format!("{}/{}", m.types.as_ref().unwrap().kind, m.name_any()))
        .collect();
    assert_eq!(kinds[0], "Deployment/web");
    assert!(kinds[1].starts_with("Service/web-expose-"));
    assert_eq!(kinds[2], "ManualScalerTrait/web-scaler");
    assert_eq!(kinds[3], "Deployment/worker");
    assert_eq!(kinds.len(), 4);
    assert_eq!(manifests.primary_workload().unwrap().name_any(), "web");
}

#[test]
fn test_assemble_is_deterministic() {
    let rev = revision();
    let options = [WorkloadOption::NameByComponentRevision, WorkloadOption::PrepareForRollout];

    let first = serde_json::to_value(assemble(&rev, &options).unwrap().manifests()).unwrap();
    let second = serde_json::to_value(assemble(&rev, &options).unwrap().manifests()).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_missing_owner_is_precondition_error() {
    let mut rev = revision();
    rev.spec.application_configuration["metadata"]
        .as_object_mut()
        .unwrap()
        .remove("ownerReferences");

    let err = assemble(&rev, &[]).unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {}", err);
}

#[test]
fn test_missing_revision_hash_is_precondition_error() {
    let mut rev = revision();
    rev.metadata.labels = None;

    let err = assemble(&rev, &[]).unwrap_err();
    assert!(err.is_precondition(), "unexpected error: {}", err);
}

#[test]
fn test_undecodable_app_config_is_precondition_error() {
    let mut rev = revision();
    rev.spec.application_configuration = json!({"spec": {"components": "nope"}});

    let err = assemble(&rev, &[]).unwrap_err();
    assert!(err.is_precondition());
}

#[test]
fn test_missing_component_document() {
    let mut rev = revision();
    rev.spec.components.remove(1);

    let err = assemble(&rev, &[]).unwrap_err();
    assert!(matches!(err, AssembleError::ComponentNotFound(ref name) if name == "worker"));
}

#[test]
fn test_undecodable_trait_aborts_assembly() {
    let mut rev = revision();
    rev.spec.application_configuration["spec"]["components"][0]["traits"][0]["trait"] =
        json!({"metadata": {}});

    let err = assemble(&rev, &[]).unwrap_err();
    match err {
        AssembleError::Decode { component, what, .. } => {
            assert_eq!(component, "web");
            assert_eq!(what, "trait #0");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_workload_ref_path_conflict() {
    let mut rev = revision();
    rev.spec.application_configuration["spec"]["components"][0]["traits"][1]["trait"]["spec"] =
        json!("scalar");

    let err = assemble(&rev, &[]).unwrap_err();
    assert!(matches!(err, AssembleError::WorkloadRef { ref trait_name, .. } if trait_name == "web-scaler"));
}

#[test]
fn test_helm_component_emits_auxiliaries() {
    let mut rev = revision();
    rev.spec.components[1].raw["spec"]["helm"] = json!({
        "release": {
            "apiVersion": "helm.toolkit.fluxcd.io/v2beta1",
            "kind": "HelmRelease",
            "metadata": {"name": "myapp-worker-rls"},
        },
        "repository": {
            "apiVersion": "source.toolkit.fluxcd.io/v1beta1",
            "kind": "HelmRepository",
            "metadata": {"name": "myapp-worker-repo"},
        },
    });

    let manifests = assemble(&rev, &[]).unwrap();
    let worker = manifests.component("worker").unwrap();

    assert_eq!(worker.auxiliaries.len(), 2);
    assert_eq!(worker.auxiliaries[0].name_any(), "myapp-worker-repo");
    assert_eq!(worker.auxiliaries[1].name_any(), "myapp-worker-rls");
    assert_eq!(worker.auxiliaries[1].namespace().as_deref(), Some("default"));
    assert_eq!(manifests.manifests().len(), 6);
}
