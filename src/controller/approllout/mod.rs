//! AppRollout controller
//!
//! Moves an application from a source revision to a target revision:
//! materializes both revisions' resources, hands the workloads to a
//! [`RolloutPlanExecutor`] and garbage collects the source once the target
//! is fully rolled out.

mod finalizer;
mod helper;
mod reconcile;
mod status;

pub use reconcile::reconcile;

use crate::config::ControllerConfig;
use crate::controller::assemble::AssembleError;
use crate::controller::clock::{Clock, SystemClock};
use crate::controller::cluster::{ClusterClient, ClusterError};
use crate::controller::dispatch::DispatchError;
use crate::controller::events::EventRecorder;
use crate::controller::plan::{PlanError, RolloutPlanExecutor};
use crate::crd::app_rollout::{AppRollout, TransitionError};
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Requeue delay after a failed pass
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("AppRollout missing namespace")]
    MissingNamespace,

    #[error("Invalid AppRollout: {0}")]
    Precondition(String),

    #[error("Assembly failed: {0}")]
    Assemble(#[from] AssembleError),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Kubernetes API error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Application revision {0} not found")]
    RevisionNotFound(String),

    #[error("Rollout plan failed: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Reconciliation did not finish within {0:?}")]
    Timeout(Duration),
}

pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub executor: Arc<dyn RolloutPlanExecutor>,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// When Some, records reconciliation counts, durations and transitions
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        executor: Arc<dyn RolloutPlanExecutor>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            cluster,
            executor,
            recorder,
            clock: Arc::new(SystemClock),
            config,
            metrics,
        }
    }
}

/// Error policy for the controller
///
/// Reconciliation errors are expected and retried, hence `warn!`.
pub fn error_policy(rollout: Arc<AppRollout>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        rollout = ?rollout.name_any(),
        namespace = ?rollout.namespace(),
        error = %error,
        "Reconcile error (will retry)"
    );

    if let Some(ref metrics) = ctx.metrics {
        // Duration unknown for errors, use 0
        metrics.record_reconciliation_error(0.0);
    }

    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
#[path = "approllout_test.rs"]
mod tests;
