use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub(crate) cycles: Counter,
    pub(crate) cycle_failures: Counter,
    pub(crate) records_created: Counter,
    pub(crate) records_deleted: Counter,
    pub(crate) cloud_writes: Counter,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "cycles",
            "Reconciliation cycles that performed work",
            metrics.cycles.clone(),
        );
        registry.register(
            "cycle_failures",
            "Reconciliation cycles with at least one failed node update",
            metrics.cycle_failures.clone(),
        );
        registry.register(
            "records_created",
            "Assignment records created",
            metrics.records_created.clone(),
        );
        registry.register(
            "records_deleted",
            "Assignment records deleted",
            metrics.records_deleted.clone(),
        );
        registry.register(
            "cloud_writes",
            "Node identity-list writes issued to the cloud API",
            metrics.cloud_writes.clone(),
        );
        metrics
    }
}
