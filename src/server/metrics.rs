//! Prometheus metrics of the controller
//!
//! - `kvela_reconciliations_total{result}` - passes by outcome
//! - `kvela_reconcile_duration_seconds{result}` - pass latency
//! - `kvela_rollout_transitions_total{state}` - rolling states entered

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    duration: HistogramVec,
    transitions: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("kvela_reconciliations_total", "AppRollout reconciliations by result"),
            &["result"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "kvela_reconcile_duration_seconds",
                "Duration of AppRollout reconciliations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["result"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new(
                "kvela_rollout_transitions_total",
                "Rolling states entered by AppRollouts",
            ),
            &["state"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(transitions.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            duration,
            transitions,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.record("success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.record("error", duration_secs);
    }

    fn record(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_transition(&self, state: &str) {
        self.transitions.with_label_values(&[state]).inc();
    }

    /// Text exposition of all metrics
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_reconciliations_by_result() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_success(0.2);
        metrics.record_reconciliation_success(0.3);
        metrics.record_reconciliation_error(0.0);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"kvela_reconciliations_total{result="success"} 2"#));
        assert!(text.contains(r#"kvela_reconciliations_total{result="error"} 1"#));
        assert!(text.contains("kvela_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn test_counts_transitions_by_state() {
        let metrics = create_metrics().unwrap();
        metrics.record_transition("Rolling");
        metrics.record_transition("Succeeded");
        metrics.record_transition("Rolling");

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"kvela_rollout_transitions_total{state="Rolling"} 2"#));
        assert!(text.contains(r#"kvela_rollout_transitions_total{state="Succeeded"} 1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = create_metrics().unwrap();
        let b = create_metrics().unwrap();
        a.record_transition("Failed");

        assert!(!b.encode().unwrap().contains("Failed"));
    }
}
