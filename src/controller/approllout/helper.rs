use super::{Context, ReconcileError};
use crate::controller::assemble::{assemble, AssembledManifests, WorkloadOption};
use crate::controller::cluster::{resource_ref, ClusterError};
use crate::controller::dispatch::{DispatchError, Dispatcher, DEFAULT_CONFLICT_RETRIES};
use crate::controller::labels::{resource_tracker_name, ANNOTATION_INPLACE_UPGRADE};
use crate::controller::plan::RolloutTargets;
use crate::crd::app_revision::ApplicationRevision;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

pub(super) async fn get_revision(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Option<ApplicationRevision>, ReconcileError> {
    Ok(ctx.cluster.get_revision(namespace, name).await?)
}

/// Tracker of the revision `name` in `namespace`
pub(super) fn tracker_of(name: &str, namespace: &str) -> String {
    resource_tracker_name(name, namespace)
}

fn is_inplace_upgrade(revision: &ApplicationRevision) -> bool {
    revision
        .spec
        .application_configuration
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ANNOTATION_INPLACE_UPGRADE))
        .and_then(Value::as_str)
        == Some("true")
}

/// Assemble a revision the way rollouts address it
///
/// Workloads are named after their component revision so that source and
/// target coexist, unless the application asks for in-place upgrades.
/// `prepare` additionally pauses the workloads.
pub(super) fn assemble_for_rollout(
    revision: &ApplicationRevision,
    prepare: bool,
) -> Result<AssembledManifests, ReconcileError> {
    let mut options = vec![if is_inplace_upgrade(revision) {
        WorkloadOption::PrepareForInplaceUpgrade
    } else {
        WorkloadOption::NameByComponentRevision
    }];
    if prepare {
        options.push(WorkloadOption::PrepareForRollout);
    }
    Ok(assemble(revision, &options)?)
}

/// Workload the rollout moves replicas of
///
/// The first listed component, or the first component of the revision.
pub(super) fn rollout_workload<'a>(
    manifests: &'a AssembledManifests,
    component_list: &[String],
) -> Result<&'a DynamicObject, ReconcileError> {
    match component_list.first() {
        Some(component) => manifests.workload(component).ok_or_else(|| {
            ReconcileError::Precondition(format!(
                "component {} is not part of the application revision",
                component
            ))
        }),
        None => manifests
            .primary_workload()
            .ok_or_else(|| ReconcileError::Precondition("application revision has no components".to_string())),
    }
}

pub(super) fn rollout_targets(
    target: &ApplicationRevision,
    source: Option<&ApplicationRevision>,
    component_list: &[String],
) -> Result<RolloutTargets, ReconcileError> {
    let target_manifests = assemble_for_rollout(target, true)?;
    let target_workload = rollout_workload(&target_manifests, component_list)?.clone();
    let source_workload = match source {
        Some(source) => {
            let manifests = assemble_for_rollout(source, true)?;
            Some(rollout_workload(&manifests, component_list)?.clone())
        }
        None => None,
    };
    debug!(
        target = %target_workload.name_any(),
        source = ?source_workload.as_ref().map(|w| w.name_any()),
        "Resolved rollout workloads"
    );
    Ok(RolloutTargets {
        target: target_workload,
        source: source_workload,
    })
}

/// Materialize the source revision unless its rollout workload already runs
pub(super) async fn ensure_source(
    ctx: &Context,
    source: &ApplicationRevision,
    component_list: &[String],
) -> Result<(), ReconcileError> {
    let manifests = assemble_for_rollout(source, true)?;
    let workload = resource_ref(rollout_workload(&manifests, component_list)?)?;
    if ctx.cluster.get_resource(&workload).await?.is_some() {
        debug!(workload = %workload, "Source workload present");
        return Ok(());
    }

    info!(revision = %source.name_any(), workload = %workload, "Materializing source revision");
    Dispatcher::new(ctx.cluster.clone(), source)
        .dispatch(&manifests.manifests())
        .await?;
    Ok(())
}

/// Dispatch a revision prepared for rollout and take over its workload
///
/// Resources shared with `previous` are adopted from its tracker instead of
/// being recreated. Once the workload is visible its controller owner
/// reference is disabled so the application no longer drives it.
pub(super) async fn emit_for_rollout(
    ctx: &Context,
    revision: &ApplicationRevision,
    component_list: &[String],
    previous: Option<&ApplicationRevision>,
) -> Result<(), ReconcileError> {
    let manifests = assemble_for_rollout(revision, true)?;
    let workload = rollout_workload(&manifests, component_list)?.clone();

    let mut dispatcher = Dispatcher::new(ctx.cluster.clone(), revision);
    if let Some(previous) = previous {
        dispatcher = dispatcher.enable_upgrade_and_skip_gc(tracker_of(
            &previous.name_any(),
            &previous.namespace().unwrap_or_default(),
        ));
    }
    dispatcher.dispatch(&manifests.manifests()).await?;

    let live = verify_workload_exists(ctx, &workload).await?;
    disable_controller_owner(ctx, live).await
}

/// Poll for a workload with bounded exponential backoff
pub(super) async fn verify_workload_exists(
    ctx: &Context,
    workload: &DynamicObject,
) -> Result<DynamicObject, ReconcileError> {
    let resource = resource_ref(workload)?;
    let mut delays = ctx.config.verify_backoff.delays();
    loop {
        if let Some(live) = ctx.cluster.get_resource(&resource).await? {
            return Ok(live);
        }
        match delays.next() {
            Some(delay) => {
                debug!(workload = %resource, ?delay, "Workload not visible yet");
                tokio::time::sleep(delay).await;
            }
            None => return Err(ClusterError::NotFound(resource.to_string()).into()),
        }
    }
}

/// Flip `controller` to false on every owner reference of the workload
async fn disable_controller_owner(ctx: &Context, mut live: DynamicObject) -> Result<(), ReconcileError> {
    let resource = resource_ref(&live)?;
    for _ in 0..DEFAULT_CONFLICT_RETRIES {
        let mut changed = false;
        for owner in live.owner_references_mut().iter_mut() {
            if owner.controller == Some(true) {
                owner.controller = Some(false);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        match ctx.cluster.replace_resource(&live).await {
            Ok(_) => {
                debug!(workload = %resource, "Disabled controller owner of workload");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                live = ctx
                    .cluster
                    .get_resource(&resource)
                    .await?
                    .ok_or_else(|| ClusterError::NotFound(resource.to_string()))?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(DispatchError::ConflictRetriesExhausted(resource.to_string(), DEFAULT_CONFLICT_RETRIES).into())
}

/// Hand the target's resources back to the application and collect the source
///
/// The rollout workload keeps the size it was rolled out to.
pub(super) async fn finalize_succeeded(
    ctx: &Context,
    target: &ApplicationRevision,
    component_list: &[String],
    target_size: Option<i32>,
    source_tracker: Option<String>,
) -> Result<(), ReconcileError> {
    let assembled = assemble_for_rollout(target, false)?;
    let workload = resource_ref(rollout_workload(&assembled, component_list)?)?;
    let mut manifests = assembled.manifests();
    if let Some(size) = target_size {
        for manifest in manifests.iter_mut() {
            if resource_ref(manifest).ok().as_ref() != Some(&workload) {
                continue;
            }
            if let Some(spec) = manifest.data.get_mut("spec").and_then(Value::as_object_mut) {
                spec.insert("replicas".to_string(), Value::from(size));
            }
        }
    }

    let mut dispatcher = Dispatcher::new(ctx.cluster.clone(), target);
    if let Some(source_tracker) = source_tracker {
        dispatcher = dispatcher.enable_gc(source_tracker);
    }
    dispatcher.dispatch(&manifests).await?;
    Ok(())
}

/// Re-dispatch the source revision and collect what the target added
pub(super) async fn revert_to_source(
    ctx: &Context,
    source: &ApplicationRevision,
    target_tracker: String,
) -> Result<(), ReconcileError> {
    let manifests = assemble_for_rollout(source, false)?;
    Dispatcher::new(ctx.cluster.clone(), source)
        .enable_gc(target_tracker)
        .dispatch(&manifests.manifests())
        .await?;
    Ok(())
}
