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

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use stratum_common::{CircuitState, InstanceMetrics};

/// Point-in-time view of one circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive failures counted toward the open threshold
    pub failure_count: u32,
    /// Consecutive successes since the last failure
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused while the circuit was open
    pub rejected_calls: u64,
    /// `total_failures / (total_failures + total_successes) * 100`, 0 when no calls completed
    pub failure_rate: f64,
    /// Mean over the bounded response-time window
    pub average_response_time_ms: f64,
    pub half_open_calls_in_flight: u32,
    pub last_failure_time: Option<SystemTime>,
    pub last_success_time: Option<SystemTime>,
    pub state_changed_at: SystemTime,
}

/// Load balancer state for one service name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerSnapshot {
    pub strategy: String,
    /// Round-robin cursor, present only for the round-robin strategy
    pub cursor: Option<usize>,
    /// In-flight calls per instance id, present only for least-connections
    pub connection_counts: Option<HashMap<String, usize>>,
}

/// One instance as reported in a metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub version: String,
    pub address: String,
    pub is_healthy: bool,
    pub metrics: InstanceMetrics,
    pub circuit_breaker: CircuitBreakerMetrics,
}

/// Per-service aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub canary_instances: usize,
    pub instances: Vec<InstanceSnapshot>,
    pub load_balancer: Option<BalancerSnapshot>,
}

impl ServiceMetrics {
    /// Builds the aggregate counts from the instance list.
    pub fn from_instances(
        instances: Vec<InstanceSnapshot>,
        canary_instances: usize,
        load_balancer: Option<BalancerSnapshot>,
    ) -> Self {
        let healthy_instances = instances.iter().filter(|i| i.is_healthy).count();
        Self {
            total_instances: instances.len(),
            healthy_instances,
            unhealthy_instances: instances.len() - healthy_instances,
            canary_instances,
            instances,
            load_balancer,
        }
    }
}

/// Complete orchestrator metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub region: String,
    pub strategy: String,
    pub running: bool,
    pub uptime_ms: u64,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub subscriptions: usize,
    pub services: BTreeMap<String, ServiceMetrics>,
}

impl OrchestratorMetrics {
    pub fn new(region: impl Into<String>, strategy: impl Into<String>, uptime_ms: u64) -> Self {
        Self {
            region: region.into(),
            strategy: strategy.into(),
            running: false,
            uptime_ms,
            total_instances: 0,
            healthy_instances: 0,
            unhealthy_instances: 0,
            subscriptions: 0,
            services: BTreeMap::new(),
        }
    }

    /// Adds a service and folds its counts into the totals.
    pub fn insert_service(&mut self, name: impl Into<String>, service: ServiceMetrics) {
        self.total_instances += service.total_instances;
        self.healthy_instances += service.healthy_instances;
        self.unhealthy_instances += service.unhealthy_instances;
        self.services.insert(name.into(), service);
    }
}
