//! Chart release and repository generation
//!
//! A chart module is a YAML document with a `release` and a `repository`
//! section, each holding the spec of the corresponding chart controller
//! object:
//!
//! ```yaml
//! release:
//!   chart:
//!     spec:
//!       chart: podinfo
//!       version: "5.1.4"
//!   values:
//!     replicaCount: 1
//! repository:
//!   url: https://stefanprodan.github.io/podinfo
//! ```

use super::AppfileError;
use crate::crd::app_config::HelmModuleResource;
use serde_json::{json, Map, Value};
use tracing::debug;

pub const HELM_RELEASE_API_VERSION: &str = "helm.toolkit.fluxcd.io/v2beta1";
pub const HELM_RELEASE_KIND: &str = "HelmRelease";
pub const HELM_REPOSITORY_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta1";
pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";

/// Reconcile interval of both objects when the module sets none
pub const DEFAULT_INTERVAL: &str = "5m0s";

pub fn repository_name(app_name: &str, svc_name: &str) -> String {
    format!("{}-{}-repo", app_name, svc_name)
}

pub fn release_name(app_name: &str, svc_name: &str) -> String {
    format!("{}-{}-rls", app_name, svc_name)
}

/// Take a section of the module as a mapping; absent or null means empty
fn section(
    module: &mut Map<String, Value>,
    key: &'static str,
    workload: &str,
) -> Result<Map<String, Value>, AppfileError> {
    match module.remove(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(AppfileError::NotAMapping {
            workload: workload.to_string(),
            field: key,
        }),
    }
}

/// Build the release and repository of service `svc_name`
///
/// `values` from the application override the chart values of the module
/// key by key. The release always sources its chart from the generated
/// repository.
pub fn generate_release_and_repository(
    module_spec: &str,
    svc_name: &str,
    app_name: &str,
    namespace: &str,
    values: &Map<String, Value>,
) -> Result<HelmModuleResource, AppfileError> {
    let invalid = |source| AppfileError::InvalidModule {
        workload: svc_name.to_string(),
        source,
    };
    let mut module = match serde_yaml::from_str::<Value>(module_spec).map_err(invalid)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err(AppfileError::NotAMapping {
                workload: svc_name.to_string(),
                field: "module",
            })
        }
    };

    let repo_name = repository_name(app_name, svc_name);
    let mut repo_spec = section(&mut module, "repository", svc_name)?;
    repo_spec
        .entry("interval")
        .or_insert_with(|| json!(DEFAULT_INTERVAL));

    let mut release_spec = section(&mut module, "release", svc_name)?;
    release_spec
        .entry("interval")
        .or_insert_with(|| json!(DEFAULT_INTERVAL));

    let mut chart_values = match release_spec.remove("values") {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(_) => {
            return Err(AppfileError::NotAMapping {
                workload: svc_name.to_string(),
                field: "release.values",
            })
        }
    };
    chart_values.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    if !chart_values.is_empty() {
        release_spec.insert("values".to_string(), Value::Object(chart_values));
    }

    let chart = release_spec
        .entry("chart")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AppfileError::NotAMapping {
            workload: svc_name.to_string(),
            field: "release.chart",
        })?;
    let chart_spec = chart
        .entry("spec")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| AppfileError::NotAMapping {
            workload: svc_name.to_string(),
            field: "release.chart.spec",
        })?;
    chart_spec.insert(
        "sourceRef".to_string(),
        json!({
            "kind": HELM_REPOSITORY_KIND,
            "namespace": namespace,
            "name": repo_name,
        }),
    );

    debug!(service = %svc_name, app = %app_name, repository = %repo_name, "Generated chart module objects");

    Ok(HelmModuleResource {
        release: json!({
            "apiVersion": HELM_RELEASE_API_VERSION,
            "kind": HELM_RELEASE_KIND,
            "metadata": {"name": release_name(app_name, svc_name), "namespace": namespace},
            "spec": release_spec,
        }),
        repository: json!({
            "apiVersion": HELM_REPOSITORY_API_VERSION,
            "kind": HELM_REPOSITORY_KIND,
            "metadata": {"name": repo_name, "namespace": namespace},
            "spec": repo_spec,
        }),
    })
}
