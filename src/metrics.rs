use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::pipeline::Stage;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Pushed,
    DryRun,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: Stage,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the handler.
pub struct Metrics {
    pub notifications_total: Family<OutcomeLabels, Counter>,
    pub stage_failures_total: Family<StageLabels, Counter>,
    pub downloaded_bytes: Counter,
    pub notification_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let notifications_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "gitmotel_notifications",
            "Processed notification records by outcome",
            notifications_total.clone(),
        );

        let stage_failures_total = Family::<StageLabels, Counter>::default();
        registry.register(
            "gitmotel_stage_failures",
            "Failed notification records by failing stage",
            stage_failures_total.clone(),
        );

        let downloaded_bytes = Counter::default();
        registry.register(
            "gitmotel_downloaded_bytes",
            "Archive bytes downloaded from object storage",
            downloaded_bytes.clone(),
        );

        let notification_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 14));
        registry.register(
            "gitmotel_notification_duration_seconds",
            "Time to process one notification record",
            notification_duration_seconds.clone(),
        );

        Self {
            notifications_total,
            stage_failures_total,
            downloaded_bytes,
            notification_duration_seconds,
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.notifications_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub fn record_failure(&self, stage: Stage) {
        self.record_outcome(Outcome::Failed);
        self.stage_failures_total
            .get_or_create(&StageLabels { stage })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
