use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LockLabels {
    pub outcome: LockOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LockOutcome {
    Acquired,
    Contended,
    Expired,
    Released,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the coordination layer.
pub struct Metrics {
    // -- leases --
    pub lock_events: Family<LockLabels, Counter>,

    // -- allocation --
    pub ids_allocated: Counter,
    pub id_alloc_failures: Counter,

    // -- lists --
    pub list_pushes: Counter,
    pub sync_errors: Counter,
    pub corrupted_values: Counter,

    // -- connections --
    pub connections_ready: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lock_events = Family::<LockLabels, Counter>::default();
        registry.register(
            "syncstore_lock_events",
            "Lease acquisitions, contention, local expiry and release events",
            lock_events.clone(),
        );

        let ids_allocated = Counter::default();
        registry.register(
            "syncstore_ids_allocated",
            "Identifiers granted by id allocators",
            ids_allocated.clone(),
        );

        let id_alloc_failures = Counter::default();
        registry.register(
            "syncstore_id_alloc_failures",
            "Allocation requests answered with an error",
            id_alloc_failures.clone(),
        );

        let list_pushes = Counter::default();
        registry.register(
            "syncstore_list_pushes",
            "Entries appended to lists",
            list_pushes.clone(),
        );

        let sync_errors = Counter::default();
        registry.register(
            "syncstore_sync_errors",
            "Replays rejected because the cursor left the retained window",
            sync_errors.clone(),
        );

        let corrupted_values = Counter::default();
        registry.register(
            "syncstore_corrupted_values",
            "Stored values dropped because they failed to decode",
            corrupted_values.clone(),
        );

        let connections_ready: Gauge = Gauge::default();
        registry.register(
            "syncstore_connections_ready",
            "Connections whose sessions are all established",
            connections_ready.clone(),
        );

        Self {
            lock_events,
            ids_allocated,
            id_alloc_failures,
            list_pushes,
            sync_errors,
            corrupted_values,
            connections_ready,
        }
    }

    pub fn lock_event(&self, outcome: LockOutcome) {
        self.lock_events.get_or_create(&LockLabels { outcome }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, held by the facade.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all coordination metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Prometheus text exposition of the registry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Err(e) = encode(&mut out, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let registry = MetricsRegistry::new();
        registry.metrics.list_pushes.inc();
        registry.metrics.lock_event(LockOutcome::Contended);
        let text = registry.render();
        assert!(text.contains("syncstore_list_pushes_total 1"));
        assert!(text.contains("outcome=\"Contended\""));
    }
}
