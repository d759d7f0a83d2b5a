//! Kubernetes events for AppRollout lifecycle changes
//!
//! Production code uses `KubeEventRecorder` which publishes `events.k8s.io`
//! events through `kube::runtime::events`. Tests use `MockRecorder` which
//! keeps events in memory for assertions.

use crate::crd::app_rollout::AppRollout;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use tracing::warn;

/// Controller name reported on published events
pub const REPORTER: &str = "kvela-approllout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Event about a rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutEvent {
    pub kind: EventKind,
    /// CamelCase reason, e.g. `RolloutRestarted`
    pub reason: String,
    pub message: String,
}

impl RolloutEvent {
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Records events about rollouts
///
/// Recording is best-effort: failures are logged and never fail a
/// reconciliation.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, rollout: &AppRollout, event: RolloutEvent);
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, rollout: &AppRollout, event: RolloutEvent) {
        let ev = Event {
            type_: match event.kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &rollout.object_ref(&())).await {
            warn!(
                rollout = ?rollout.name_any(),
                reason = %event.reason,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Event recorder storing events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockRecorder {
    events: std::sync::Mutex<Vec<RolloutEvent>>,
}

#[cfg(test)]
impl MockRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    pub fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for MockRecorder {
    #[allow(clippy::unwrap_used)]
    async fn record(&self, _rollout: &AppRollout, event: RolloutEvent) {
        self.events.lock().unwrap().push(event);
    }
}
