//! Metrics collection for GenLoop
//!
//! This module provides Prometheus metrics for observability. All metrics
//! are updated from the control loop; the watchdog reads them back for its
//! periodic report.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for a GenLoop node
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub registry: Arc<Registry>,

    /// Tasks accepted into the registry
    pub tasks_admitted_total: IntCounter,

    /// Requests dropped at admission (budget exceeded, empty prompt)
    pub tasks_rejected_total: IntCounter,

    /// Tasks that ran to completion (budget exhausted or end-of-sequence)
    pub tasks_completed_total: IntCounter,

    /// Tasks removed by an explicit cancel directive
    pub tasks_cancelled_total: IntCounter,

    /// Tokens produced across all tasks
    pub tokens_generated_total: IntCounter,

    /// Frames delivered to the dispatcher, keepalives included
    pub frames_sent_total: IntCounter,

    /// Successful reconnections after a transport failure
    pub reconnects_total: IntCounter,

    /// Full batch recompositions
    pub batch_rebuilds_total: IntCounter,

    /// Currently active tasks
    pub active_tasks: IntGauge,

    /// Step engine invocation duration
    pub step_duration: Histogram,

    /// Batch size per step
    pub batch_size: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: NodeMetrics = NodeMetrics::new();
}

impl NodeMetrics {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let tasks_admitted_total = IntCounter::new(
            "node_tasks_admitted_total",
            "Tasks accepted into the registry",
        )
        .unwrap();

        let tasks_rejected_total = IntCounter::new(
            "node_tasks_rejected_total",
            "Requests dropped at admission",
        )
        .unwrap();

        let tasks_completed_total = IntCounter::new(
            "node_tasks_completed_total",
            "Tasks that ran to completion",
        )
        .unwrap();

        let tasks_cancelled_total = IntCounter::new(
            "node_tasks_cancelled_total",
            "Tasks removed by an explicit cancel",
        )
        .unwrap();

        let tokens_generated_total = IntCounter::new(
            "node_tokens_generated_total",
            "Tokens produced across all tasks",
        )
        .unwrap();

        let frames_sent_total = IntCounter::new(
            "node_frames_sent_total",
            "Frames delivered to the dispatcher",
        )
        .unwrap();

        let reconnects_total = IntCounter::new(
            "node_reconnects_total",
            "Successful reconnections after a transport failure",
        )
        .unwrap();

        let batch_rebuilds_total = IntCounter::new(
            "node_batch_rebuilds_total",
            "Full batch recompositions",
        )
        .unwrap();

        let active_tasks =
            IntGauge::new("node_active_tasks", "Currently active tasks").unwrap();

        let step_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "node_step_duration_seconds",
                "Step engine invocation duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )
        .unwrap();

        let batch_size = Histogram::with_opts(
            prometheus::HistogramOpts::new("node_batch_size", "Batch size per step")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(tasks_admitted_total.clone())).unwrap();
        registry.register(Box::new(tasks_rejected_total.clone())).unwrap();
        registry.register(Box::new(tasks_completed_total.clone())).unwrap();
        registry.register(Box::new(tasks_cancelled_total.clone())).unwrap();
        registry.register(Box::new(tokens_generated_total.clone())).unwrap();
        registry.register(Box::new(frames_sent_total.clone())).unwrap();
        registry.register(Box::new(reconnects_total.clone())).unwrap();
        registry.register(Box::new(batch_rebuilds_total.clone())).unwrap();
        registry.register(Box::new(active_tasks.clone())).unwrap();
        registry.register(Box::new(step_duration.clone())).unwrap();
        registry.register(Box::new(batch_size.clone())).unwrap();

        NodeMetrics {
            registry,
            tasks_admitted_total,
            tasks_rejected_total,
            tasks_completed_total,
            tasks_cancelled_total,
            tokens_generated_total,
            frames_sent_total,
            reconnects_total,
            batch_rebuilds_total,
            active_tasks,
            step_duration,
            batch_size,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = NodeMetrics::new();

        metrics.tasks_admitted_total.inc();
        metrics.active_tasks.set(3);
        metrics.batch_size.observe(3.0);

        let output = metrics.gather();
        assert!(output.contains("node_tasks_admitted_total"));
        assert!(output.contains("node_active_tasks"));
    }
}
