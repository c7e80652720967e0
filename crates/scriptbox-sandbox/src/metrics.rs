//! Prometheus metrics for the sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `success`, or the failure kind (`CompileError`, `Timeout`, ...).
    pub outcome: String,
}

/// Prometheus metrics for the sandbox.
pub struct SandboxMetrics {
    /// Total number of executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds by outcome.
    pub execution_duration_seconds: Family<OutcomeLabels, Histogram>,
    /// Contexts whose runtime is currently alive.
    pub contexts_live: Gauge<i64, AtomicI64>,
}

impl SandboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "scriptbox_executions_total",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter(),
                )
            });
        registry.register(
            "scriptbox_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let contexts_live = Gauge::default();
        registry.register(
            "scriptbox_contexts_live",
            "Execution contexts currently alive",
            contexts_live.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            contexts_live,
        }
    }

    /// Record one finished execution.
    pub fn record_execution(&self, outcome: &str, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Publish the live context count.
    pub fn set_contexts_live(&self, live: usize) {
        self.contexts_live
            .set(i64::try_from(live).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn execution_counter_is_labelled_by_outcome() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_execution("success", 0.5);
        metrics.record_execution("success", 1.0);
        metrics.record_execution("Timeout", 5.0);

        let labels = OutcomeLabels {
            outcome: "success".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&labels).get(), 2);
    }

    #[test]
    fn live_gauge_tracks_contexts() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.set_contexts_live(3);
        assert_eq!(metrics.contexts_live.get(), 3);
    }

    #[test]
    fn metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.record_execution("RuntimeError", 0.01);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("scriptbox_executions_total"), "{buf}");
        assert!(buf.contains("scriptbox_execution_duration_seconds"), "{buf}");
        assert!(buf.contains("scriptbox_contexts_live"), "{buf}");
    }

    #[test]
    fn metrics_are_thread_safe() {
        let mut registry = Registry::default();
        let metrics = std::sync::Arc::new(SandboxMetrics::new(&mut registry));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || m.record_execution("success", 0.1))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let labels = OutcomeLabels {
            outcome: "success".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&labels).get(), 4);
    }
}
