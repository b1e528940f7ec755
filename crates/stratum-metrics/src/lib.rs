//! Stratum Metrics
//!
//! Metrics plumbing for the stratum orchestration core.
//!
//! # Components
//!
//! - [`OrchestratorMetrics`]: serializable snapshot of instance counts, per-service
//!   circuit breaker state and load balancer state
//! - [`ResponseTimeWindow`]: bounded ring buffer of response-time samples used by
//!   every circuit breaker
//! - [`MetricsSink`]: where the orchestrator pushes its periodic snapshot
//!
//! # Sinks
//!
//! - [`TracingMetricsSink`] (default): one structured `tracing` event per snapshot
//! - [`MemoryMetricsSink`]: retains the last N snapshots for polling

mod sink;
mod snapshot;
mod window;

pub use sink::{MemoryMetricsSink, MetricsSink, TracingMetricsSink};
pub use snapshot::{
    BalancerSnapshot, CircuitBreakerMetrics, InstanceSnapshot, OrchestratorMetrics,
    ServiceMetrics,
};
pub use window::{ResponseTimeWindow, DEFAULT_WINDOW_CAPACITY};
