use super::{PlanError, PlanResult, RolloutPlanExecutor, RolloutTargets};
use crate::controller::cluster::{resource_ref, ClusterClient};
use crate::controller::dispatch::DEFAULT_CONFLICT_RETRIES;
use crate::crd::app_rollout::{
    BatchReplicas, RollingEvent, RollingState, RolloutPlan, RolloutPlanStatus,
};
use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How often a waiting batch is looked at again
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cumulative target replica counts after each batch
///
/// Percentages are of `target_size` and rounded up (so a non-zero percentage
/// always moves at least one replica). Counts are clamped to `target_size`
/// and the last batch always completes the rollout. A plan without batches
/// rolls everything in a single batch.
///
/// # Examples
/// ```ignore
/// // 10 replicas in batches of 20%, 3 and the rest
/// assert_eq!(resolve_batch_sizes(&plan, 10), Ok(vec![2, 5, 10]));
/// ```
pub fn resolve_batch_sizes(plan: &RolloutPlan, target_size: i32) -> Result<Vec<i32>, String> {
    if target_size < 0 {
        return Err(format!("invalid target size {}", target_size));
    }
    if plan.rollout_batches.is_empty() {
        return Ok(vec![target_size]);
    }

    let mut cumulative = Vec::with_capacity(plan.rollout_batches.len());
    let mut total: i32 = 0;
    for (i, batch) in plan.rollout_batches.iter().enumerate() {
        let size = match &batch.replicas {
            BatchReplicas::Count(n) if *n >= 0 => *n,
            BatchReplicas::Count(n) => {
                return Err(format!("batch {} has negative replicas {}", i, n));
            }
            BatchReplicas::Percent(p) => parse_percent(p)
                .map(|pct| ((target_size as f64 * pct as f64) / 100.0).ceil() as i32)
                .ok_or_else(|| format!("batch {} has invalid replicas {:?}", i, p))?,
        };
        total = total.saturating_add(size).min(target_size);
        cumulative.push(total);
    }
    if let Some(last) = cumulative.last_mut() {
        *last = target_size;
    }
    Ok(cumulative)
}

fn parse_percent(value: &str) -> Option<i32> {
    let pct = value.strip_suffix('%')?.trim().parse::<i32>().ok()?;
    (0..=100).contains(&pct).then_some(pct)
}

fn spec_replicas(obj: &DynamicObject) -> Option<i32> {
    obj.data
        .get("spec")?
        .get("replicas")?
        .as_i64()
        .and_then(|r| i32::try_from(r).ok())
}

/// Whether the workload reports at least `desired` ready replicas
///
/// Objects without a `status` block are treated as ready. A status without
/// `readyReplicas` means none are ready.
fn is_batch_ready(obj: &DynamicObject, desired: i32) -> bool {
    match obj.data.get("status") {
        Some(Value::Object(status)) => {
            let ready = status
                .get("readyReplicas")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ready >= desired as i64
        }
        _ => true,
    }
}

/// Set `spec.replicas`, returning whether it changed
fn set_replicas(data: &mut Value, replicas: i32) -> bool {
    let Some(spec) = data.get_mut("spec").and_then(Value::as_object_mut) else {
        return false;
    };
    if spec.get("replicas").and_then(Value::as_i64) == Some(replicas as i64) {
        return false;
    }
    spec.insert("replicas".to_string(), Value::from(replicas));
    true
}

/// Clear the pause switches set when preparing for rollout
fn unpause(data: &mut Value) -> bool {
    let Some(spec) = data.get_mut("spec").and_then(Value::as_object_mut) else {
        return false;
    };
    let mut changed = false;
    if spec.get("paused") == Some(&Value::Bool(true)) {
        spec.insert("paused".to_string(), Value::Bool(false));
        changed = true;
    }
    if let Some(strategy) = spec.get_mut("updateStrategy").and_then(Value::as_object_mut) {
        if strategy.get("paused") == Some(&Value::Bool(true)) {
            strategy.insert("paused".to_string(), Value::Bool(false));
            changed = true;
        }
    }
    changed
}

/// Default rollout plan executor scaling workloads through `spec.replicas`
///
/// Each batch raises the target to its cumulative size and lowers the source
/// by the same amount, then waits for the target to report enough ready
/// replicas before moving to the next batch.
pub struct BatchPlanExecutor {
    cluster: Arc<dyn ClusterClient>,
    poll_interval: Duration,
}

impl BatchPlanExecutor {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn waiting(&self, mut status: RolloutPlanStatus, message: String) -> PlanResult {
        status.message = Some(message);
        PlanResult {
            requeue_after: Some(self.poll_interval),
            status,
        }
    }

    async fn live(&self, workload: &DynamicObject) -> Result<DynamicObject, PlanError> {
        let r = resource_ref(workload)?;
        self.cluster
            .get_resource(&r)
            .await?
            .ok_or_else(|| PlanError::WorkloadMissing(r.to_string()))
    }

    async fn resolve_target_size(
        &self,
        targets: &RolloutTargets,
        plan: &RolloutPlan,
    ) -> Result<i32, PlanError> {
        if let Some(size) = plan.target_size {
            return Ok(size);
        }
        match &targets.source {
            Some(source) => {
                let live = self.live(source).await?;
                Ok(spec_replicas(&live).or_else(|| spec_replicas(source)).unwrap_or(1))
            }
            None => Ok(1),
        }
    }

    /// Scale a workload, retrying on conflict; returns the live object
    async fn scale(
        &self,
        workload: &DynamicObject,
        replicas: i32,
        resume: bool,
    ) -> Result<DynamicObject, PlanError> {
        let r = resource_ref(workload)?;
        for _ in 0..DEFAULT_CONFLICT_RETRIES {
            let mut live = self.live(workload).await?;
            let scaled = set_replicas(&mut live.data, replicas);
            let resumed = resume && unpause(&mut live.data);
            if !scaled && !resumed {
                return Ok(live);
            }
            match self.cluster.replace_resource(&live).await {
                Ok(written) => {
                    info!(workload = %r, replicas, "Scaled workload");
                    return Ok(written);
                }
                Err(e) if e.is_conflict() => {
                    debug!(workload = %r, "Conflict scaling workload, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PlanError::ConflictRetriesExhausted(r.to_string()))
    }

    fn distinct_source<'a>(&self, targets: &'a RolloutTargets) -> Option<&'a DynamicObject> {
        let source = targets.source.as_ref()?;
        let same = resource_ref(source).ok() == resource_ref(&targets.target).ok();
        (!same).then_some(source)
    }
}

#[async_trait]
impl RolloutPlanExecutor for BatchPlanExecutor {
    async fn reconcile(
        &self,
        targets: &RolloutTargets,
        plan: &RolloutPlan,
        mut status: RolloutPlanStatus,
    ) -> Result<PlanResult, PlanError> {
        match status.rolling_state {
            RollingState::Rolling => {}
            RollingState::Deleting | RollingState::Abandoning => {
                info!(
                    target = %targets.target.name_any(),
                    batch = status.current_batch,
                    "Rollout abandoned, leaving workloads as they are"
                );
                status.message = Some(format!(
                    "Rollout abandoned at batch {} with {} upgraded replicas",
                    status.current_batch, status.upgraded_replicas
                ));
                status.state_transition(RollingEvent::Finalized)?;
                return Ok(PlanResult {
                    requeue_after: None,
                    status,
                });
            }
            _ => {
                return Ok(PlanResult {
                    requeue_after: None,
                    status,
                })
            }
        }

        let target_size = match status.rollout_target_size {
            Some(size) => size,
            None => self.resolve_target_size(targets, plan).await?,
        };
        status.rollout_target_size = Some(target_size);

        let batches = match resolve_batch_sizes(plan, target_size) {
            Ok(batches) => batches,
            Err(reason) => {
                status.message = Some(format!("Invalid rollout plan: {}", reason));
                status.state_transition(RollingEvent::PlanFailed)?;
                return Ok(PlanResult {
                    requeue_after: None,
                    status,
                });
            }
        };

        if plan.paused {
            return Ok(self.waiting(status, "Rollout paused".to_string()));
        }

        let current = status.current_batch.max(0) as usize;
        if current < batches.len() {
            if let Some(partition) = plan.batch_partition {
                if status.current_batch > partition {
                    let message = format!(
                        "Waiting for batchPartition to reach batch {}",
                        status.current_batch
                    );
                    return Ok(self.waiting(status, message));
                }
            }

            let desired = batches[current];
            let target = self.scale(&targets.target, desired, true).await?;
            if let Some(source) = self.distinct_source(targets) {
                self.scale(source, target_size - desired, false).await?;
            }

            if !is_batch_ready(&target, desired) {
                let message = format!(
                    "Batch {} waiting for {} ready replicas of {}",
                    current,
                    desired,
                    target.name_any()
                );
                return Ok(self.waiting(status, message));
            }

            status.upgraded_replicas = desired;
            status.current_batch = current as i32 + 1;
            info!(
                target = %targets.target.name_any(),
                batch = current,
                upgraded = desired,
                "Rollout batch completed"
            );
            if current + 1 < batches.len() {
                let message = format!("Batch {} completed", current);
                return Ok(self.waiting(status, message));
            }
        }

        // Every batch is done; make sure the target runs unpaused at full size
        self.scale(&targets.target, target_size, true).await?;
        status.upgraded_replicas = target_size;
        status.message = Some(format!("Rolled out {} replicas", target_size));
        status.state_transition(RollingEvent::PlanSucceeded)?;
        Ok(PlanResult {
            requeue_after: None,
            status,
        })
    }
}
