#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::controller::assemble::assemble;
use crate::crd::app_revision::{ApplicationRevision, WorkloadGVK};
use kube::ResourceExt;
use serde_json::json;

const PODINFO: &str = r#"
release:
  chart:
    spec:
      chart: podinfo
      version: "5.1.4"
  values:
    replicaCount: 1
repository:
  url: https://stefanprodan.github.io/podinfo
"#;

/// Renders `expose` into a Service plus an optional Ingress; fails `broken`
struct ScriptedEvaluator;

impl TemplateEvaluator for ScriptedEvaluator {
    fn evaluate(
        &self,
        context: &ProcessContext,
        workload_trait: &WorkloadTrait,
    ) -> Result<Evaluation, String> {
        match workload_trait.name.as_str() {
            "expose" => {
                let port = workload_trait.params.get("port").cloned().unwrap_or(json!(80));
                let mut assists = vec![Assist {
                    type_name: "expose".to_string(),
                    name: "service".to_string(),
                    object: json!({
                        "apiVersion": "v1",
                        "kind": "Service",
                        "metadata": {"name": format!("{}-svc", context.component)},
                        "spec": {"ports": [{"port": port}]}
                    }),
                }];
                if workload_trait.params.get("ingress") == Some(&json!(true)) {
                    assists.push(Assist {
                        type_name: "expose".to_string(),
                        name: String::new(),
                        object: json!({
                            "apiVersion": "networking.k8s.io/v1",
                            "kind": "Ingress",
                            "metadata": {"labels": {"team": "web"}}
                        }),
                    });
                }
                Ok(Evaluation {
                    output: None,
                    assists,
                })
            }
            "scalar" => Ok(Evaluation {
                output: None,
                assists: vec![Assist {
                    type_name: "scalar".to_string(),
                    name: "value".to_string(),
                    object: json!(3),
                }],
            }),
            "broken" => Err("reference \"parameter.port\" not found".to_string()),
            _ => Ok(Evaluation::default()),
        }
    }
}

fn params(value: serde_json::Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("params must be an object"),
    }
}

fn podinfo(traits: Vec<WorkloadTrait>) -> Workload {
    Workload {
        name: "podinfo".to_string(),
        template: PODINFO.to_string(),
        params: params(json!({"replicaCount": 2})),
        traits,
        scopes: vec![WorkloadScope {
            name: "myapp-health".to_string(),
            api_version: "core.oam.dev/v1alpha2".to_string(),
            kind: "HealthScope".to_string(),
        }],
    }
}

fn deployment_gvk() -> WorkloadGVK {
    WorkloadGVK {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
    }
}

fn expose(extra: serde_json::Value) -> WorkloadTrait {
    WorkloadTrait {
        name: "expose".to_string(),
        params: params(extra),
    }
}

#[test]
fn test_component_carries_chart_module() {
    let (component, _) = generate_component_from_helm_module(
        &podinfo(vec![]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap();

    assert_eq!(component.metadata.name.as_deref(), Some("podinfo"));
    assert_eq!(component.metadata.namespace.as_deref(), Some("default"));
    assert_eq!(
        component.metadata.labels.unwrap().get("app.oam.dev/name").map(String::as_str),
        Some("myapp")
    );
    assert_eq!(
        component.spec.workload,
        json!({"apiVersion": "apps/v1", "kind": "Deployment"})
    );
    let helm = component.spec.helm.unwrap();
    assert_eq!(helm.release["metadata"]["name"], "myapp-podinfo-rls");
    assert_eq!(helm.release["spec"]["values"]["replicaCount"], 2);
    assert_eq!(helm.repository["metadata"]["name"], "myapp-podinfo-repo");
}

#[test]
fn test_assists_become_labeled_traits() {
    let (_, entry) = generate_component_from_helm_module(
        &podinfo(vec![expose(json!({"port": 9898, "ingress": true}))]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap();

    assert_eq!(entry.component_name.as_deref(), Some("podinfo"));
    assert_eq!(entry.traits.len(), 2);

    let service = &entry.traits[0].trait_object;
    assert_eq!(service["metadata"]["name"], "podinfo-svc");
    assert_eq!(service["spec"]["ports"][0]["port"], 9898);
    assert_eq!(
        service["metadata"]["labels"],
        json!({
            "trait.oam.dev/type": "expose",
            "app.oam.dev/name": "myapp",
            "app.oam.dev/component": "podinfo",
            "trait.oam.dev/resource": "service"
        })
    );

    // Unnamed assists get no resource label and keep their own labels
    let ingress = &entry.traits[1].trait_object;
    assert_eq!(
        ingress["metadata"]["labels"],
        json!({
            "team": "web",
            "trait.oam.dev/type": "expose",
            "app.oam.dev/name": "myapp",
            "app.oam.dev/component": "podinfo"
        })
    );
}

#[test]
fn test_scopes_become_scope_references() {
    let (_, entry) = generate_component_from_helm_module(
        &podinfo(vec![]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap();

    assert_eq!(entry.scopes.len(), 1);
    let scope = &entry.scopes[0].scope_ref;
    assert_eq!(scope.kind, "HealthScope");
    assert_eq!(scope.api_version, "core.oam.dev/v1alpha2");
    assert_eq!(scope.name, "myapp-health");
}

#[test]
fn test_evaluation_failure_names_trait_and_workload() {
    let broken = WorkloadTrait {
        name: "broken".to_string(),
        params: Map::new(),
    };

    let err = generate_component_from_helm_module(
        &podinfo(vec![broken]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap_err();

    assert_eq!(
        err.to_string(),
        "evaluate template trait=broken app=podinfo: reference \"parameter.port\" not found"
    );
}

#[test]
fn test_non_object_assist_is_rejected() {
    let scalar = WorkloadTrait {
        name: "scalar".to_string(),
        params: Map::new(),
    };

    let err = generate_component_from_helm_module(
        &podinfo(vec![scalar]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap_err();

    assert!(matches!(err, AppfileError::InvalidAssist { ref assist, .. } if assist == "value"));
}

#[test]
fn test_generated_component_assembles_with_chart_objects() {
    let (component, entry) = generate_component_from_helm_module(
        &podinfo(vec![expose(json!({}))]),
        "myapp",
        "default",
        &deployment_gvk(),
        &ScriptedEvaluator,
    )
    .unwrap();

    let revision: ApplicationRevision = serde_json::from_value(json!({
        "apiVersion": "core.oam.dev/v1beta1",
        "kind": "ApplicationRevision",
        "metadata": {
            "name": "myapp-v1",
            "namespace": "default",
            "labels": {"app.oam.dev/app-revision-hash": "5f1d"}
        },
        "spec": {
            "applicationConfiguration": {
                "metadata": {
                    "name": "myapp",
                    "namespace": "default",
                    "ownerReferences": [{
                        "apiVersion": "core.oam.dev/v1beta1",
                        "kind": "Application",
                        "name": "myapp",
                        "uid": "app-uid",
                        "controller": true
                    }]
                },
                "spec": {"components": [serde_json::to_value(&entry).unwrap()]}
            },
            "components": [{"raw": serde_json::to_value(&component).unwrap()}]
        }
    }))
    .unwrap();

    let manifests = assemble(&revision, &[]).unwrap().manifests();

    let kinds: Vec<String> = manifests
        .iter()
        .map(|m| m.types.as_ref().unwrap().kind.clone())
        .collect();
    assert_eq!(kinds, vec!["Deployment", "Service", "HelmRepository", "HelmRelease"]);
    assert_eq!(manifests[0].name_any(), "podinfo");
    assert_eq!(manifests[3].name_any(), "myapp-podinfo-rls");
    assert_eq!(
        manifests[3].labels().get("app.oam.dev/component").map(String::as_str),
        Some("podinfo")
    );
}
