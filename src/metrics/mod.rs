use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

// ============================================================================
// Metrics Module - Prometheus metrics for the dispatch path
// ============================================================================
//
// Tracks:
// - Queue lease lifecycle (leased, acknowledged, deferred)
// - Lease renewal outcomes
// - Optimistic concurrency conflicts seen by handlers
// - Processing latency per outcome
//
// `render()` produces the text exposition format; serving it is left to
// whatever transport embeds this crate.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Queue Metrics
    pub items_leased: IntCounter,
    pub items_acknowledged: IntCounter,
    pub items_deferred: IntCounter,

    // Lease Metrics
    pub lease_renewals: IntCounterVec,

    // Event Store Metrics
    pub revision_conflicts: IntCounter,

    pub processing_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Queue Metrics
        let items_leased = IntCounter::new("queue_items_leased_total", "Total queue items leased")?;
        registry.register(Box::new(items_leased.clone()))?;

        let items_acknowledged = IntCounter::new(
            "queue_items_acknowledged_total",
            "Total queue items processed and removed",
        )?;
        registry.register(Box::new(items_acknowledged.clone()))?;

        let items_deferred = IntCounter::new(
            "queue_items_deferred_total",
            "Total queue items handed back after a failure",
        )?;
        registry.register(Box::new(items_deferred.clone()))?;

        // Lease Metrics
        let lease_renewals = IntCounterVec::new(
            Opts::new("queue_lease_renewals_total", "Lease renewals by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(lease_renewals.clone()))?;

        // Event Store Metrics
        let revision_conflicts = IntCounter::new(
            "event_store_revision_conflicts_total",
            "Appends rejected because the revision was already taken",
        )?;
        registry.register(Box::new(revision_conflicts.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new("queue_item_processing_duration_seconds", "Queue item processing duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        Ok(Self {
            registry,
            items_leased,
            items_acknowledged,
            items_deferred,
            lease_renewals,
            revision_conflicts,
            processing_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> anyhow::Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }

    pub fn record_processed(&self, duration_secs: f64, success: bool) {
        let outcome = if success { "acknowledged" } else { "deferred" };
        if success {
            self.items_acknowledged.inc();
        } else {
            self.items_deferred.inc();
        }
        self.processing_duration
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_renewal(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.lease_renewals.with_label_values(&[outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.items_leased.inc();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_record_processed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_processed(0.05, true);
        metrics.record_processed(0.2, false);
        metrics.record_processed(0.01, true);

        assert_eq!(metrics.items_acknowledged.get(), 2);
        assert_eq!(metrics.items_deferred.get(), 1);
        assert_eq!(
            metrics
                .processing_duration
                .with_label_values(&["acknowledged"])
                .get_sample_count(),
            2
        );
    }

    #[test]
    fn test_record_renewal() {
        let metrics = Metrics::new().unwrap();
        metrics.record_renewal(true);
        metrics.record_renewal(true);
        metrics.record_renewal(false);

        assert_eq!(metrics.lease_renewals.with_label_values(&["success"]).get(), 2);
        assert_eq!(metrics.lease_renewals.with_label_values(&["failure"]).get(), 1);
    }

    #[test]
    fn test_render_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.items_leased.inc();
        metrics.revision_conflicts.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("queue_items_leased_total 1"));
        assert!(text.contains("event_store_revision_conflicts_total 1"));
    }
}
