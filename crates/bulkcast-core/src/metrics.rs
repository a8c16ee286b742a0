//! Prometheus metrics for the dispatch engine

use bulkcast_common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Engine metrics, registered in a registry owned by the engine
pub struct EngineMetrics {
    registry: Registry,
    pub attempts_total: IntCounterVec,
    pub batches_total: IntCounter,
    pub retries_scheduled_total: IntCounter,
    pub campaigns_running: IntGauge,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Failed to register metrics: {}", e))
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let attempts_total = IntCounterVec::new(
            Opts::new("bulkcast_attempts_total", "Delivery attempts by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let batches_total = IntCounter::new("bulkcast_batches_total", "Batches dispatched")
            .map_err(metrics_error)?;
        let retries_scheduled_total = IntCounter::new(
            "bulkcast_retries_scheduled_total",
            "Retries scheduled after transient failures",
        )
        .map_err(metrics_error)?;
        let campaigns_running = IntGauge::new("bulkcast_campaigns_running", "Campaigns currently running")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(attempts_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(batches_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(retries_scheduled_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(campaigns_running.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            attempts_total,
            batches_total,
            retries_scheduled_total,
            campaigns_running,
        })
    }

    /// Count one finished attempt; `outcome` is "delivered" or the failure kind
    pub fn record_attempt(&self, outcome: &str) {
        self.attempts_total.with_label_values(&[outcome]).inc();
    }

    /// Metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_format() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_attempt("delivered");
        metrics.record_attempt("timeout");
        metrics.batches_total.inc();
        metrics.campaigns_running.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("bulkcast_attempts_total{outcome=\"delivered\"} 1"));
        assert!(text.contains("bulkcast_batches_total 1"));
        assert!(text.contains("bulkcast_campaigns_running 1"));
    }
}
