use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Finalizer guarding AppRollout cleanup
pub const APP_ROLLOUT_FINALIZER: &str = "finalizers.approllout.oam.dev";

/// Condition type set while a referenced revision cannot be found
pub const CONDITION_REVISION_NOT_FOUND: &str = "RevisionNotFound";

/// AppRollout declares a transition from a source revision to a target revision
///
/// Without `sourceAppRevisionName` the rollout scales the target in place.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "core.oam.dev",
    version = "v1beta1",
    kind = "AppRollout",
    shortname = "approllout",
    namespaced,
    status = "AppRolloutStatus",
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".spec.targetAppRevisionName"}"#,
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceAppRevisionName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.rollingState"}"#,
    printcolumn = r#"{"name":"Batch", "type":"integer", "jsonPath":".status.currentBatch"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct AppRolloutSpec {
    /// Revision currently serving; absent for a scale-in-place operation
    #[serde(
        rename = "sourceAppRevisionName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_app_revision_name: Option<String>,

    /// Revision to roll out
    #[serde(rename = "targetAppRevisionName")]
    pub target_app_revision_name: String,

    /// Components whose workload is rolled. Defaults to the first component.
    #[serde(rename = "componentList", default, skip_serializing_if = "Vec::is_empty")]
    pub component_list: Vec<String>,

    /// Batched plan handed to the rollout plan executor
    #[serde(rename = "rolloutPlan", default)]
    pub rollout_plan: RolloutPlan,

    /// Revert to the source revision when a failed rollout is deleted
    #[serde(rename = "revertOnDelete", default)]
    pub revert_on_delete: bool,
}

/// Ordered batches with pause semantics
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutPlan {
    /// Final replica count of the target workload.
    /// Defaults to the source workload size, or 1 without a source.
    #[serde(rename = "targetSize", skip_serializing_if = "Option::is_none")]
    pub target_size: Option<i32>,

    /// Batches in order; each batch adds its replicas to the target
    #[serde(rename = "rolloutBatches", default, skip_serializing_if = "Vec::is_empty")]
    pub rollout_batches: Vec<RolloutBatch>,

    /// Highest batch index allowed to run; later batches wait for it to be raised
    #[serde(rename = "batchPartition", skip_serializing_if = "Option::is_none")]
    pub batch_partition: Option<i32>,

    /// Halt batch progression until cleared
    #[serde(default)]
    pub paused: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutBatch {
    /// Replicas added in this batch: absolute (e.g. 2) or percentage of the target size (e.g. "25%")
    #[schemars(schema_with = "crate::crd::int_or_string_schema")]
    pub replicas: BatchReplicas,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum BatchReplicas {
    Count(i32),
    Percent(String),
}

/// Rolling state of a rollout
///
/// Changed only through [`RollingEvent`]s via [`RollingState::on`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RollingState {
    /// Freshly created or restarted after a terminal state
    #[default]
    Initial,
    /// Resolving and materializing the source and target revisions
    LocatingTarget,
    /// Batches are being executed by the rollout plan executor
    Rolling,
    /// Target fully rolled out; source resources garbage collected
    Succeeded,
    /// Plan failed; both revisions' resources are kept
    Failed,
    /// Rollout deleted before anything was in flight
    Deleting,
    /// Rollout deleted mid-flight; the executor is unwinding
    Abandoning,
}

/// Named events driving [`RollingState`] transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollingEvent {
    /// Source or target revision changed since the last reconciliation
    Modified,
    /// Start resolving the revisions
    LocateTarget,
    /// Both revisions resolved and the target materialized
    AppLocated,
    PlanSucceeded,
    PlanFailed,
    /// Collecting the source after success failed; the final batch is retried
    GcFailed,
    /// Deletion requested while the finalizer is present
    Deleted,
    /// Deletion found a transition in flight
    Abandon,
    /// Cleanup after deletion completed
    Finalized,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid rolling transition: event {event:?} in state {state:?}")]
pub struct TransitionError {
    pub state: RollingState,
    pub event: RollingEvent,
}

impl RollingState {
    /// Succeeded and Failed are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, RollingState::Succeeded | RollingState::Failed)
    }

    /// Deleting and Abandoning only happen after deletion was requested
    pub fn is_deleting(self) -> bool {
        matches!(self, RollingState::Deleting | RollingState::Abandoning)
    }

    /// Transition table of the rollout state machine
    pub fn on(self, event: RollingEvent) -> Result<RollingState, TransitionError> {
        use RollingEvent as E;
        use RollingState as S;

        let next = match (self, event) {
            // In-flight transitions finish before a modification is honored
            (S::Initial | S::LocatingTarget | S::Rolling, E::Modified) => self,
            (S::Succeeded | S::Failed, E::Modified) => S::Initial,

            (S::Initial, E::LocateTarget) => S::LocatingTarget,
            (S::Initial | S::LocatingTarget, E::AppLocated) => S::Rolling,

            (S::Rolling, E::PlanSucceeded) => S::Succeeded,
            (S::Rolling, E::PlanFailed) => S::Failed,
            (S::Succeeded, E::GcFailed) => S::Rolling,

            (S::Initial | S::LocatingTarget | S::Rolling, E::Deleted) => S::Deleting,
            (S::Deleting | S::Abandoning, E::Deleted) => self,
            (S::Deleting, E::Abandon) => S::Abandoning,
            (S::Deleting | S::Abandoning, E::Finalized) => S::Failed,

            (state, event) => return Err(TransitionError { state, event }),
        };
        Ok(next)
    }
}

/// Observed condition of a rollout
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last status change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Status owned by the rollout plan executor
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutPlanStatus {
    #[serde(rename = "rollingState", default)]
    pub rolling_state: RollingState,

    /// Index of the batch being executed (0-indexed)
    #[serde(rename = "currentBatch", default)]
    pub current_batch: i32,

    /// Replicas of the target workload upgraded so far
    #[serde(rename = "upgradedReplicas", default)]
    pub upgraded_replicas: i32,

    /// Target size resolved when rolling started
    #[serde(rename = "rolloutTargetSize", skip_serializing_if = "Option::is_none")]
    pub rollout_target_size: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RolloutCondition>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RolloutPlanStatus {
    /// Apply an event to the rolling state
    pub fn state_transition(&mut self, event: RollingEvent) -> Result<(), TransitionError> {
        let next = self.rolling_state.on(event)?;
        if next != self.rolling_state {
            debug!(from = ?self.rolling_state, to = ?next, event = ?event, "Rolling state transition");
        }
        self.rolling_state = next;
        Ok(())
    }

    /// Back to `Initial` with progress cleared; conditions are kept
    pub fn reset(&mut self) {
        *self = RolloutPlanStatus {
            conditions: std::mem::take(&mut self.conditions),
            ..Default::default()
        };
    }

    /// Insert or replace the condition with the same type
    ///
    /// The transition time is kept when the condition status does not change.
    pub fn set_condition(&mut self, mut condition: RolloutCondition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    pub fn remove_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    pub fn condition(&self, type_: &str) -> Option<&RolloutCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Status keys left out of the serialized status while empty
///
/// A merge patch leaves absent keys untouched, so status writes send these
/// as `null` to clear them.
pub const OMITTABLE_STATUS_FIELDS: &[&str] = &[
    "rolloutTargetSize",
    "conditions",
    "message",
    "lastUpgradedTargetAppRevision",
    "lastSourceAppRevision",
];

/// Status of the AppRollout
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AppRolloutStatus {
    #[serde(flatten)]
    pub rollout_status: RolloutPlanStatus,

    /// Target revision of the last transition the controller worked on
    #[serde(
        rename = "lastUpgradedTargetAppRevision",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_upgraded_target_app_revision: Option<String>,

    /// Source revision of the last transition the controller worked on
    #[serde(rename = "lastSourceAppRevision", skip_serializing_if = "Option::is_none")]
    pub last_source_app_revision: Option<String>,
}

impl AppRolloutStatus {
    pub fn rolling_state(&self) -> RollingState {
        self.rollout_status.rolling_state
    }

    pub fn state_transition(&mut self, event: RollingEvent) -> Result<(), TransitionError> {
        self.rollout_status.state_transition(event)
    }
}

#[cfg(test)]
#[path = "app_rollout_test.rs"]
mod tests;
