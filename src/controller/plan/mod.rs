//! Rollout plan execution
//!
//! The rollout state machine hands the resolved target and source workloads
//! to a [`RolloutPlanExecutor`], which shifts replicas batch by batch and
//! reports progress through the nested [`RolloutPlanStatus`].

pub mod batch;

pub use batch::BatchPlanExecutor;

use crate::controller::cluster::ClusterError;
use crate::crd::app_rollout::{RolloutPlan, RolloutPlanStatus, TransitionError};
use async_trait::async_trait;
use kube::core::DynamicObject;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Cluster error during rollout: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Workload {0} not found")]
    WorkloadMissing(String),

    #[error("Gave up updating workload {0} after repeated conflicts")]
    ConflictRetriesExhausted(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Workloads a rollout moves replicas between
#[derive(Debug, Clone)]
pub struct RolloutTargets {
    pub target: DynamicObject,
    /// Absent for scale-in-place rollouts
    pub source: Option<DynamicObject>,
}

/// Result of one executor pass
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    /// When to look at the rollout again; `None` when nothing is pending
    pub requeue_after: Option<Duration>,
    pub status: RolloutPlanStatus,
}

/// Executes a rollout plan one step per call
///
/// Implementations must be idempotent: the same inputs against the same
/// cluster state produce the same status.
#[async_trait]
pub trait RolloutPlanExecutor: Send + Sync {
    async fn reconcile(
        &self,
        targets: &RolloutTargets,
        plan: &RolloutPlan,
        status: RolloutPlanStatus,
    ) -> Result<PlanResult, PlanError>;
}
