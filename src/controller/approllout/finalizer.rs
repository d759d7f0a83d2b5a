use super::helper::{get_revision, revert_to_source, tracker_of};
use super::{Context, ReconcileError};
use crate::controller::events::RolloutEvent;
use crate::crd::app_rollout::{
    AppRollout, AppRolloutStatus, RollingEvent, RollingState, APP_ROLLOUT_FINALIZER,
};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

pub(super) enum FinalizerStep {
    /// The pass is over
    Done(Action),
    Continue,
}

fn has_finalizer(rollout: &AppRollout) -> bool {
    rollout.finalizers().iter().any(|f| f == APP_ROLLOUT_FINALIZER)
}

/// Register the finalizer, or run deletion handling when deletion was requested
///
/// Terminal rollouts release the finalizer right away. A rollout caught
/// mid-flight moves to `Deleting`; when it was `Rolling` it is abandoned and
/// the pass continues so the executor can unwind.
pub(super) async fn handle_finalizer(
    rollout: &AppRollout,
    status: &mut AppRolloutStatus,
    ctx: &Context,
) -> Result<FinalizerStep, ReconcileError> {
    let name = rollout.name_any();

    if rollout.meta().deletion_timestamp.is_none() {
        if has_finalizer(rollout) {
            return Ok(FinalizerStep::Continue);
        }
        let mut updated = rollout.clone();
        updated
            .finalizers_mut()
            .push(APP_ROLLOUT_FINALIZER.to_string());
        ctx.cluster.update_rollout_finalizers(&updated).await?;
        info!(rollout = ?name, "Registered AppRollout finalizer");
        return Ok(FinalizerStep::Done(Action::await_change()));
    }

    if !has_finalizer(rollout) {
        debug!(rollout = ?name, "Deleted AppRollout has no finalizer left");
        return Ok(FinalizerStep::Done(Action::await_change()));
    }

    let state = status.rolling_state();
    match state {
        RollingState::Succeeded => {
            info!(rollout = ?name, "Safe to delete the succeeded rollout");
        }
        RollingState::Failed => {
            if rollout.spec.revert_on_delete {
                revert(rollout, status, ctx).await?;
            }
            info!(rollout = ?name, "Deleting the failed rollout");
        }
        _ => {
            ctx.recorder
                .record(
                    rollout,
                    RolloutEvent::normal("RolloutDeleted", "Rollout deleted, releasing the resources"),
                )
                .await;
            status.state_transition(RollingEvent::Deleted)?;
            if state == RollingState::Rolling {
                status.state_transition(RollingEvent::Abandon)?;
            }
            if status.rolling_state() == RollingState::Abandoning {
                info!(rollout = ?name, "Abandoning in-flight rollout");
                return Ok(FinalizerStep::Continue);
            }
            info!(rollout = ?name, state = ?state, "Nothing in flight, releasing the rollout");
        }
    }

    remove_finalizer(rollout, ctx).await?;
    Ok(FinalizerStep::Done(Action::await_change()))
}

async fn remove_finalizer(rollout: &AppRollout, ctx: &Context) -> Result<(), ReconcileError> {
    let mut updated = rollout.clone();
    updated.finalizers_mut().retain(|f| f != APP_ROLLOUT_FINALIZER);
    ctx.cluster.update_rollout_finalizers(&updated).await?;
    info!(rollout = ?rollout.name_any(), "Removed AppRollout finalizer");
    Ok(())
}

/// Bring back the source revision of a failed rollout
async fn revert(
    rollout: &AppRollout,
    status: &AppRolloutStatus,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let source_name = status
        .last_source_app_revision
        .clone()
        .or_else(|| rollout.spec.source_app_revision_name.clone())
        .filter(|s| !s.is_empty());
    let target_name = status
        .last_upgraded_target_app_revision
        .clone()
        .unwrap_or_else(|| rollout.spec.target_app_revision_name.clone());

    let Some(source_name) = source_name else {
        debug!(rollout = ?rollout.name_any(), "Scale-only rollout, nothing to revert");
        return Ok(());
    };
    let Some(source) = get_revision(ctx, &namespace, &source_name).await? else {
        warn!(
            rollout = ?rollout.name_any(),
            revision = %source_name,
            "Source revision is gone, cannot revert"
        );
        return Ok(());
    };

    info!(rollout = ?rollout.name_any(), source = %source_name, target = %target_name, "Reverting failed rollout");
    revert_to_source(ctx, &source, tracker_of(&target_name, &namespace)).await?;
    ctx.recorder
        .record(
            rollout,
            RolloutEvent::normal(
                "RolloutReverted",
                format!("Reverted to application revision {}", source_name),
            ),
        )
        .await;
    Ok(())
}
