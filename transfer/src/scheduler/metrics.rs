use courier_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [TransferScheduler](super::TransferScheduler).
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of jobs waiting to become active
    pub queued: Gauge,
    /// Number of active jobs
    pub active: Gauge,
    /// Number of work units dispatched
    pub dispatched: Counter,
    /// Number of jobs completed
    pub completed: Counter,
    /// Number of jobs failed
    pub failed: Counter,
    /// Number of jobs canceled
    pub canceled: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "queued",
            "Number of jobs waiting to become active",
            metrics.queued.clone(),
        );
        context.register("active", "Number of active jobs", metrics.active.clone());
        context.register(
            "dispatched",
            "Number of work units dispatched",
            metrics.dispatched.clone(),
        );
        context.register(
            "completed",
            "Number of jobs completed",
            metrics.completed.clone(),
        );
        context.register("failed", "Number of jobs failed", metrics.failed.clone());
        context.register(
            "canceled",
            "Number of jobs canceled",
            metrics.canceled.clone(),
        );
        metrics
    }
}
