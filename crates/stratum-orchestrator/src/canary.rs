use std::borrow::Borrow;
use stratum_common::ServiceInstance;

/// Splits a service's instances into stable and canary sets and mixes them by
/// traffic percentage.
///
/// Counts are derived from the stable fleet size `n`:
/// `canary = ceil(n * pct / 100)`, `stable = n - canary`. With 10 stable and
/// 10 canary instances at 10% the router keeps 9 stable and 1 canary. Below
/// 100% at least one stable instance is always kept, so a small fleet never
/// routes everything to the canary.
///
/// When the split cannot be honored (no stable instances, or fewer canaries
/// than the computed share) every instance is returned unfiltered rather than
/// under-delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanaryRouter {
    traffic_percentage: u8,
}

impl CanaryRouter {
    pub fn new(traffic_percentage: u8) -> Self {
        Self {
            traffic_percentage: traffic_percentage.min(100),
        }
    }

    pub fn traffic_percentage(&self) -> u8 {
        self.traffic_percentage
    }

    /// True when at least one instance carries the canary marker.
    pub fn has_canary<T: Borrow<ServiceInstance>>(instances: &[T]) -> bool {
        instances.iter().any(is_canary)
    }

    /// `(stable, canary)` counts for a stable fleet of `stable_total` instances.
    pub fn split_counts(&self, stable_total: usize) -> (usize, usize) {
        let canary = (stable_total * self.traffic_percentage as usize).div_ceil(100);
        let stable = if self.traffic_percentage < 100 && stable_total > 0 {
            (stable_total - canary).max(1)
        } else {
            stable_total - canary
        };
        (stable, canary)
    }

    /// Applies the split, preserving list order within each set.
    pub fn route<T: Borrow<ServiceInstance>>(&self, instances: Vec<T>) -> Vec<T> {
        if !Self::has_canary(&instances) {
            return instances;
        }

        let stable_total = instances.iter().filter(|i| !is_canary(*i)).count();
        let canary_total = instances.len() - stable_total;
        if stable_total == 0 {
            return instances;
        }

        let (stable_count, canary_count) = self.split_counts(stable_total);
        if canary_count > canary_total {
            return instances;
        }

        let (canary, stable): (Vec<T>, Vec<T>) =
            instances.into_iter().partition(is_canary);
        stable
            .into_iter()
            .take(stable_count)
            .chain(canary.into_iter().take(canary_count))
            .collect()
    }
}

fn is_canary<T: Borrow<ServiceInstance>>(instance: &T) -> bool {
    Borrow::<ServiceInstance>::borrow(instance).is_canary()
}

impl Default for CanaryRouter {
    fn default() -> Self {
        Self::new(10)
    }
}
