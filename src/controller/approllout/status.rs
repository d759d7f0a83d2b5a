use super::{Context, ReconcileError};
use crate::controller::clock::Clock;
use crate::controller::cluster::ClusterError;
use crate::crd::app_rollout::{AppRollout, AppRolloutStatus, RolloutCondition, CONDITION_REVISION_NOT_FOUND};
use kube::ResourceExt;
use tracing::debug;

pub(super) fn revision_not_found(clock: &dyn Clock, revision: &str) -> RolloutCondition {
    RolloutCondition {
        type_: CONDITION_REVISION_NOT_FOUND.to_string(),
        status: "True".to_string(),
        reason: Some("RevisionNotFound".to_string()),
        message: Some(format!("application revision {} not found", revision)),
        last_transition_time: Some(clock.timestamp()),
    }
}

/// Write `status` to the rollout's status subresource
///
/// Skipped when the stored status is already equal. Conflicts re-read the
/// rollout and reapply the status, up to the configured number of attempts.
pub(super) async fn update_status(
    ctx: &Context,
    rollout: &AppRollout,
    status: &AppRolloutStatus,
) -> Result<(), ReconcileError> {
    let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();
    let mut current = rollout.clone();

    for attempt in 1..=ctx.config.status_retries {
        if current.status.as_ref() == Some(status) {
            debug!(rollout = ?name, "Status unchanged, skipping write");
            return Ok(());
        }
        current.status = Some(status.clone());
        match ctx.cluster.update_rollout_status(&current).await {
            Ok(_) => {
                debug!(rollout = ?name, state = ?status.rolling_state(), "Updated status");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                debug!(rollout = ?name, attempt, "Conflict writing status, re-reading rollout");
                current = ctx
                    .cluster
                    .get_rollout(&namespace, &name)
                    .await?
                    .ok_or_else(|| ClusterError::NotFound(name.clone()))?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ClusterError::Conflict(name).into())
}
