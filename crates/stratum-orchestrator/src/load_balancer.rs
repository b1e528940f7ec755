use crate::config::LoadBalancingStrategy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use stratum_common::ServiceInstance;
use stratum_metrics::BalancerSnapshot;

/// Strategy together with the state only that strategy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerState {
    RoundRobin { cursor: usize },
    Weighted,
    /// In-flight calls per instance id
    LeastConnections { connections: HashMap<String, usize> },
    Random,
}

impl BalancerState {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        match strategy {
            LoadBalancingStrategy::RoundRobin => BalancerState::RoundRobin { cursor: 0 },
            LoadBalancingStrategy::Weighted => BalancerState::Weighted,
            LoadBalancingStrategy::LeastConnections => BalancerState::LeastConnections {
                connections: HashMap::new(),
            },
            LoadBalancingStrategy::Random => BalancerState::Random,
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        match self {
            BalancerState::RoundRobin { .. } => LoadBalancingStrategy::RoundRobin,
            BalancerState::Weighted => LoadBalancingStrategy::Weighted,
            BalancerState::LeastConnections { .. } => LoadBalancingStrategy::LeastConnections,
            BalancerState::Random => LoadBalancingStrategy::Random,
        }
    }
}

/// Per-service load balancer.
///
/// The balancer never stores instances. Callers pass in the current candidate
/// list (already filtered to healthy, routable instances) on every pick, so a
/// cursor can never index a stale list.
pub struct LoadBalancer {
    state: BalancerState,
    rng: StdRng,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            state: BalancerState::new(strategy),
            rng: StdRng::from_os_rng(),
        }
    }

    /// Creates a balancer with a deterministic random source.
    pub fn with_seed(strategy: LoadBalancingStrategy, seed: u64) -> Self {
        Self {
            state: BalancerState::new(strategy),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.state.strategy()
    }

    pub fn state(&self) -> &BalancerState {
        &self.state
    }

    /// Picks the next instance among `candidates`.
    ///
    /// Returns `None` when there are no candidates; that is backpressure, not an error.
    pub fn pick<'a>(&mut self, candidates: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        let len = candidates.len();

        let index = match &mut self.state {
            BalancerState::RoundRobin { cursor } => {
                let index = *cursor % len;
                *cursor = (index + 1) % len;
                index
            }
            BalancerState::Weighted => Self::weighted_index(&mut self.rng, candidates),
            BalancerState::LeastConnections { connections } => {
                let mut best = 0;
                let mut best_count = usize::MAX;
                for (i, instance) in candidates.iter().enumerate() {
                    let count = connections.get(&instance.id).copied().unwrap_or(0);
                    if count < best_count {
                        best = i;
                        best_count = count;
                    }
                }
                *connections.entry(candidates[best].id.clone()).or_insert(0) += 1;
                best
            }
            BalancerState::Random => self.rng.random_range(0..len),
        };

        Some(candidates[index])
    }

    /// Draws in `[0, total_weight)` and walks the list subtracting weights.
    fn weighted_index(rng: &mut StdRng, candidates: &[&ServiceInstance]) -> usize {
        let total: u64 = candidates.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return rng.random_range(0..candidates.len());
        }
        let mut draw = rng.random_range(0..total);
        for (i, instance) in candidates.iter().enumerate() {
            let weight = u64::from(instance.weight);
            if draw < weight {
                return i;
            }
            draw -= weight;
        }
        candidates.len() - 1
    }

    /// Marks one in-flight call to `instance_id` as finished.
    ///
    /// Only meaningful for least-connections; a no-op otherwise.
    pub fn release(&mut self, instance_id: &str) {
        if let BalancerState::LeastConnections { connections } = &mut self.state {
            if let Some(count) = connections.get_mut(instance_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Forgets per-instance state for a removed instance.
    pub fn remove_instance(&mut self, instance_id: &str) {
        if let BalancerState::LeastConnections { connections } = &mut self.state {
            connections.remove(instance_id);
        }
    }

    pub fn connection_count(&self, instance_id: &str) -> usize {
        match &self.state {
            BalancerState::LeastConnections { connections } => {
                connections.get(instance_id).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn snapshot(&self) -> BalancerSnapshot {
        let (cursor, connection_counts) = match &self.state {
            BalancerState::RoundRobin { cursor } => (Some(*cursor), None),
            BalancerState::LeastConnections { connections } => (None, Some(connections.clone())),
            BalancerState::Weighted | BalancerState::Random => (None, None),
        };
        BalancerSnapshot {
            strategy: self.strategy().to_string(),
            cursor,
            connection_counts,
        }
    }
}
