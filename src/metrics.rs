// Numan Thabit 2025
// metrics.rs - Prometheus counters for the traffic manager
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub packets_enqueued: IntCounter,
    pub packets_emitted: IntCounter,
    pub packets_dropped: IntCounter,
    pub pool_rejects: IntCounter,
    pub predicate_evals: IntCounter,
    pub predicate_misses: IntCounter,
    pub reconfigurations: IntCounter,
    pub config_parse_failures: IntCounter,
    pub pool_depth: IntGauge,
    pub hierarchy_nodes: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("numitm".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let packets_enqueued =
            register_counter!("packets_enqueued_total", "Packets accepted by enqueue");
        let packets_emitted = register_counter!(
            "packets_emitted_total",
            "Payloads pushed to the egress buffers"
        );
        let packets_dropped = register_counter!(
            "packets_dropped_total",
            "Descriptors dropped before emission"
        );
        let pool_rejects =
            register_counter!("pool_rejects_total", "Payloads refused by a full pool port");
        let predicate_evals =
            register_counter!("predicate_evals_total", "Predicate evaluations executed");
        let predicate_misses = register_counter!(
            "predicate_misses_total",
            "Dequeues whose calendar entry was missing"
        );
        let reconfigurations =
            register_counter!("reconfigurations_total", "Hierarchy swaps completed");
        let config_parse_failures = register_counter!(
            "config_parse_failures_total",
            "Configuration documents dropped on parse failure"
        );
        let pool_depth = register_gauge!("pool_depth", "Payloads resident in the packet pool");
        let hierarchy_nodes =
            register_gauge!("hierarchy_nodes", "Nodes in the active hierarchy");

        Ok(Self {
            registry,
            packets_enqueued,
            packets_emitted,
            packets_dropped,
            pool_rejects,
            predicate_evals,
            predicate_misses,
            reconfigurations,
            config_parse_failures,
            pool_depth,
            hierarchy_nodes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.packets_enqueued.inc();
        metrics.pool_depth.set(3);
        metrics.reconfigurations.inc();
        assert!(!metrics.gather().is_empty());
    }
}
