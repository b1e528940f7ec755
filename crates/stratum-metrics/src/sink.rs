// Copyright 2025 Stratum Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::OrchestratorMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Destination for periodic orchestrator metrics snapshots.
///
/// The orchestrator calls [`MetricsSink::emit`] from its metrics task on every
/// tick. Implementations must not block for long: the call happens on the
/// runtime worker that drives the metrics task.
///
/// # Example
///
/// ```rust
/// use stratum_metrics::{MetricsSink, OrchestratorMetrics};
///
/// struct Stdout;
///
/// impl MetricsSink for Stdout {
///     fn emit(&self, metrics: &OrchestratorMetrics) {
///         println!("{} instances", metrics.total_instances);
///     }
/// }
/// ```
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metrics: &OrchestratorMetrics);
}

/// Logs each snapshot as a structured `tracing` event.
///
/// Totals go into event fields; the full snapshot is attached as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl TracingMetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, metrics: &OrchestratorMetrics) {
        match serde_json::to_string(metrics) {
            Ok(snapshot) => info!(
                region = %metrics.region,
                total = metrics.total_instances,
                healthy = metrics.healthy_instances,
                unhealthy = metrics.unhealthy_instances,
                services = metrics.services.len(),
                %snapshot,
                "orchestrator metrics"
            ),
            Err(e) => warn!("Failed to serialize metrics snapshot: {}", e),
        }
    }
}

/// Keeps the most recent snapshots in memory.
///
/// Useful for embedding applications that poll rather than push, and for tests.
pub struct MemoryMetricsSink {
    snapshots: Mutex<VecDeque<OrchestratorMetrics>>,
    capacity: usize,
}

impl MemoryMetricsSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Most recently emitted snapshot, if any.
    pub fn latest(&self) -> Option<OrchestratorMetrics> {
        self.snapshots.lock().back().cloned()
    }

    /// Number of snapshots currently retained.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn emit(&self, metrics: &OrchestratorMetrics) {
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() == self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(metrics.clone());
    }
}
