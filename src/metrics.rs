//! Queue metrics - Prometheus counters for queue throughput and routing
//!
//! The collector owns its own registry so embedding applications can merge
//! or scrape it however they like; the engine takes the collector as a
//! constructor dependency, so tests can pass a fresh instance and assert on
//! counter values directly.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Counters and gauges covering every queue operation outcome
pub struct QueueMetrics {
    registry: Registry,

    pub tasks_enqueued: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_retried: IntCounter,
    pub tasks_dead_lettered: IntCounter,
    pub tasks_failed: IntCounter,
    pub tasks_cancelled: IntCounter,
    pub claims_total: IntCounter,
    pub claims_unrouted: IntCounter,
    pub workers_registered: IntCounter,
    pub workers_online: IntGauge,
}

impl QueueMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_enqueued = IntCounter::with_opts(Opts::new(
            "relay_tasks_enqueued_total",
            "Tasks accepted by the queue",
        ))?;
        let tasks_completed = IntCounter::with_opts(Opts::new(
            "relay_tasks_completed_total",
            "Tasks finished successfully",
        ))?;
        let tasks_retried = IntCounter::with_opts(Opts::new(
            "relay_tasks_retried_total",
            "Failures rescheduled with backoff",
        ))?;
        let tasks_dead_lettered = IntCounter::with_opts(Opts::new(
            "relay_tasks_dead_lettered_total",
            "Tasks parked after exhausting retries",
        ))?;
        let tasks_failed = IntCounter::with_opts(Opts::new(
            "relay_tasks_failed_total",
            "Tasks resting at terminal failed",
        ))?;
        let tasks_cancelled = IntCounter::with_opts(Opts::new(
            "relay_tasks_cancelled_total",
            "Tasks cancelled before completion",
        ))?;
        let claims_total = IntCounter::with_opts(Opts::new(
            "relay_claims_total",
            "Claim attempts, directed and arbitrated",
        ))?;
        let claims_unrouted = IntCounter::with_opts(Opts::new(
            "relay_claims_unrouted_total",
            "Arbitrated claims with no routable worker",
        ))?;
        let workers_registered = IntCounter::with_opts(Opts::new(
            "relay_workers_registered_total",
            "Worker registrations",
        ))?;
        let workers_online = IntGauge::with_opts(Opts::new(
            "relay_workers_online",
            "Workers with a fresh heartbeat",
        ))?;

        registry.register(Box::new(tasks_enqueued.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(tasks_retried.clone()))?;
        registry.register(Box::new(tasks_dead_lettered.clone()))?;
        registry.register(Box::new(tasks_failed.clone()))?;
        registry.register(Box::new(tasks_cancelled.clone()))?;
        registry.register(Box::new(claims_total.clone()))?;
        registry.register(Box::new(claims_unrouted.clone()))?;
        registry.register(Box::new(workers_registered.clone()))?;
        registry.register(Box::new(workers_online.clone()))?;

        Ok(Self {
            registry,
            tasks_enqueued,
            tasks_completed,
            tasks_retried,
            tasks_dead_lettered,
            tasks_failed,
            tasks_cancelled,
            claims_total,
            claims_unrouted,
            workers_registered,
            workers_online,
        })
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
