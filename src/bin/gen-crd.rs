use kube::CustomResourceExt;
use kvela::crd::app_revision::ApplicationRevision;
use kvela::crd::app_rollout::AppRollout;
use kvela::crd::resource_tracker::ResourceTracker;

/// Print the CRDs as a JSON list
///
/// Pipe through `yq -P` to get YAML manifests.
fn main() -> anyhow::Result<()> {
    let crds = vec![
        AppRollout::crd(),
        ApplicationRevision::crd(),
        ResourceTracker::crd(),
    ];
    println!("{}", serde_json::to_string_pretty(&crds)?);
    Ok(())
}
