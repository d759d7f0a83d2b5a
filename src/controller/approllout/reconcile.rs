use super::finalizer::{handle_finalizer, FinalizerStep};
use super::helper::{
    emit_for_rollout, ensure_source, finalize_succeeded, get_revision, rollout_targets, tracker_of,
};
use super::status::{revision_not_found, update_status};
use super::{Context, ReconcileError};
use crate::controller::events::RolloutEvent;
use crate::crd::app_revision::ApplicationRevision;
use crate::crd::app_rollout::{
    AppRollout, AppRolloutStatus, RollingEvent, RollingState, CONDITION_REVISION_NOT_FOUND,
};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Reconcile an AppRollout resource
///
/// One pass of the rollout state machine:
/// 1. Registers the finalizer, or handles deletion
/// 2. Skips terminal rollouts whose source and target did not change
/// 3. Restarts finished rollouts whose source or target changed, and pins
///    in-flight rollouts to the revisions they started with
/// 4. Materializes source and target while locating the target
/// 5. Hands both workloads to the rollout plan executor
/// 6. Garbage collects the source once the target succeeded
///
/// Only finalizers and status are written to the AppRollout itself. The pass
/// is bounded by the configured reconcile timeout.
pub async fn reconcile(rollout: Arc<AppRollout>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start_time = Instant::now();
    let deadline = ctx.config.reconcile_timeout;

    let result = match tokio::time::timeout(deadline, reconcile_pass(&rollout, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(deadline)),
    };

    if result.is_ok() {
        let duration_secs = start_time.elapsed().as_secs_f64();
        debug!(rollout = ?rollout.name_any(), duration_secs, "Finished reconciling AppRollout");
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_success(duration_secs);
        }
    }
    result
}

async fn reconcile_pass(rollout: &AppRollout, ctx: &Context) -> Result<Action, ReconcileError> {
    let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();

    info!(rollout = ?name, namespace = ?namespace, "Reconciling AppRollout");

    let stored = rollout.status.clone().unwrap_or_default();
    let mut status = stored.clone();

    if let FinalizerStep::Done(action) = handle_finalizer(rollout, &mut status, ctx).await? {
        return Ok(action);
    }

    let result = drive(rollout, &namespace, &mut status, ctx).await;

    if status.rolling_state() != stored.rolling_state() {
        info!(
            rollout = ?name,
            from = ?stored.rolling_state(),
            to = ?status.rolling_state(),
            "Rolling state changed"
        );
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_transition(&format!("{:?}", status.rolling_state()));
        }
    }

    match result {
        Ok(action) => {
            update_status(ctx, rollout, &status).await?;
            Ok(action)
        }
        Err(e) => {
            // Keep whatever progress was made before the failure
            if status != stored {
                if let Err(write_err) = update_status(ctx, rollout, &status).await {
                    warn!(rollout = ?name, error = %write_err, "Failed to record status after error");
                }
            }
            Err(e)
        }
    }
}

/// Source or target changed since the controller last worked on the rollout
fn is_modified(status: &AppRolloutStatus, target: &str, source: &Option<String>) -> bool {
    if status.rolling_state().is_deleting() {
        return false;
    }
    let target_changed = status
        .last_upgraded_target_app_revision
        .as_deref()
        .is_some_and(|last| !last.is_empty() && last != target);
    let source_changed = status
        .last_source_app_revision
        .as_deref()
        .is_some_and(|last| !last.is_empty() && Some(last) != source.as_deref());
    target_changed || source_changed
}

async fn drive(
    rollout: &AppRollout,
    namespace: &str,
    status: &mut AppRolloutStatus,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let name = rollout.name_any();
    let spec = &rollout.spec;
    let spec_target = spec.target_app_revision_name.clone();
    let spec_source = spec
        .source_app_revision_name
        .clone()
        .filter(|s| !s.is_empty());
    if spec_target.is_empty() {
        return Err(ReconcileError::Precondition(
            "targetAppRevisionName must not be empty".to_string(),
        ));
    }

    if status.rolling_state().is_terminal()
        && status.last_upgraded_target_app_revision.as_deref() == Some(spec_target.as_str())
        && status.last_source_app_revision == spec_source
    {
        debug!(
            rollout = ?name,
            state = ?status.rolling_state(),
            "Rollout completed, no need to reconcile"
        );
        return Ok(Action::await_change());
    }

    let mut target_name = spec_target.clone();
    let mut source_name = spec_source.clone();

    if is_modified(status, &spec_target, &spec_source) {
        let terminal = status.rolling_state().is_terminal();
        status.state_transition(RollingEvent::Modified)?;
        if terminal {
            info!(
                rollout = ?name,
                target = %spec_target,
                source = ?spec_source,
                "Rollout target changed, restarting the rollout"
            );
            ctx.recorder
                .record(
                    rollout,
                    RolloutEvent::normal(
                        "RolloutRestarted",
                        format!(
                            "Rollout target changed, new target {} new source {}",
                            spec_target,
                            spec_source.as_deref().unwrap_or("<none>")
                        ),
                    ),
                )
                .await;
            status.rollout_status.reset();
            status.last_upgraded_target_app_revision = Some(spec_target.clone());
            status.last_source_app_revision = spec_source.clone();
        } else {
            debug!(
                rollout = ?name,
                target = %spec_target,
                source = ?spec_source,
                "Rollout target changed, finishing the transition in flight first"
            );
            if let Some(last) = status.last_upgraded_target_app_revision.clone() {
                target_name = last;
            }
            source_name = status.last_source_app_revision.clone();
        }
    }

    let (target, source) = if status.rolling_state().is_deleting() {
        let source = match &source_name {
            Some(n) => get_revision(ctx, namespace, n).await?,
            None => None,
        };
        let Some(target) = get_revision(ctx, namespace, &target_name).await? else {
            info!(rollout = ?name, revision = %target_name, "Target revision is gone, nothing to unwind");
            status.state_transition(RollingEvent::Finalized)?;
            return Ok(Action::await_change());
        };
        (target, source)
    } else {
        if status.rolling_state() == RollingState::Initial {
            status.state_transition(RollingEvent::LocateTarget)?;
        }

        let source = match &source_name {
            Some(n) => Some(required_revision(ctx, namespace, n, status).await?),
            None => {
                debug!(rollout = ?name, "No source revision, this is a scale operation");
                None
            }
        };
        let target = required_revision(ctx, namespace, &target_name, status).await?;
        status
            .rollout_status
            .remove_condition(CONDITION_REVISION_NOT_FOUND);

        if status.rolling_state() == RollingState::LocatingTarget {
            if let Some(source) = &source {
                ensure_source(ctx, source, &spec.component_list).await?;
            }
            emit_for_rollout(ctx, &target, &spec.component_list, source.as_ref()).await?;
            status.state_transition(RollingEvent::AppLocated)?;
            ctx.recorder
                .record(
                    rollout,
                    RolloutEvent::normal(
                        "TargetLocated",
                        format!("Application revision {} is ready to roll out", target_name),
                    ),
                )
                .await;
        }
        (target, source)
    };

    let targets = rollout_targets(&target, source.as_ref(), &spec.component_list)?;
    let result = ctx
        .executor
        .reconcile(&targets, &spec.rollout_plan, status.rollout_status.clone())
        .await?;
    status.rollout_status = result.status;

    // Abandoned transitions must not be mistaken for the new one
    if status.rolling_state() != RollingState::Abandoning {
        status.last_upgraded_target_app_revision = Some(target_name.clone());
        status.last_source_app_revision = source_name.clone();
    }

    match status.rolling_state() {
        RollingState::Succeeded => {
            info!(
                rollout = ?name,
                target = %target_name,
                source = ?source_name,
                "Rollout succeeded, collecting the source revision"
            );
            let source_tracker = source_name.as_deref().map(|s| tracker_of(s, namespace));
            if let Err(e) = finalize_succeeded(
                ctx,
                &target,
                &spec.component_list,
                status.rollout_status.rollout_target_size,
                source_tracker,
            )
            .await
            {
                warn!(rollout = ?name, error = %e, "Failed to collect the source revision");
                status.state_transition(RollingEvent::GcFailed)?;
                return Err(e);
            }
            ctx.recorder
                .record(
                    rollout,
                    RolloutEvent::normal(
                        "RolloutSucceeded",
                        format!("Rolled out application revision {}", target_name),
                    ),
                )
                .await;
        }
        RollingState::Failed if !rollout_is_deleting(rollout) => {
            warn!(
                rollout = ?name,
                target = %target_name,
                revert_on_delete = spec.revert_on_delete,
                message = ?status.rollout_status.message,
                "Rollout failed"
            );
            ctx.recorder
                .record(
                    rollout,
                    RolloutEvent::warning(
                        "RolloutFailed",
                        status
                            .rollout_status
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("Rolling out {} failed", target_name)),
                    ),
                )
                .await;
        }
        _ => {}
    }

    Ok(result
        .requeue_after
        .map(Action::requeue)
        .unwrap_or_else(Action::await_change))
}

fn rollout_is_deleting(rollout: &AppRollout) -> bool {
    rollout.metadata.deletion_timestamp.is_some()
}

/// Fetch a revision the rollout cannot proceed without
async fn required_revision(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &mut AppRolloutStatus,
) -> Result<ApplicationRevision, ReconcileError> {
    match get_revision(ctx, namespace, name).await? {
        Some(revision) => Ok(revision),
        None => {
            warn!(revision = %name, namespace = %namespace, "Cannot locate application revision");
            status
                .rollout_status
                .set_condition(revision_not_found(ctx.clock.as_ref(), name));
            Err(ReconcileError::RevisionNotFound(name.to_string()))
        }
    }
}
