use crate::canary::CanaryRouter;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, LoadBalancingStrategy};
use crate::health_checker::HealthCheckStatus;
use crate::load_balancer::LoadBalancer;
use crate::scheduler::TaskHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stratum_common::error::{Result, StratumError};
use stratum_common::{ServiceDescriptor, ServiceInstance};
use stratum_metrics::{InstanceSnapshot, ServiceMetrics};
use tokio::time::Instant;
use uuid::Uuid;

/// Registry entry: the instance plus everything it owns.
pub struct InstanceRecord {
    pub instance: ServiceInstance,
    pub breaker: Arc<CircuitBreaker>,
    /// Monotonic counterpart of `instance.last_health_check`, used for TTL expiry
    pub last_seen: Instant,
    /// Per-instance health monitor, when one is running
    pub monitor: Option<TaskHandle>,
}

impl InstanceRecord {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.instance.last_health_check = SystemTime::now();
    }

    /// Eligible for selection: healthy and not fast-failing.
    fn is_routable(&self) -> bool {
        self.instance.is_healthy && self.breaker.should_allow_execution()
    }
}

/// Service name -> instance list, plus per-service load balancers.
///
/// Plain synchronous state; the orchestrator wraps it in a lock and owns all
/// scheduling. Instance lists keep registration order.
pub struct ServiceRegistry {
    services: HashMap<String, Vec<InstanceRecord>>,
    balancers: HashMap<String, LoadBalancer>,
    strategy: LoadBalancingStrategy,
    breaker_config: CircuitBreakerConfig,
    /// `None` when canary routing is disabled
    canary: Option<CanaryRouter>,
}

impl ServiceRegistry {
    pub fn new(
        strategy: LoadBalancingStrategy,
        breaker_config: CircuitBreakerConfig,
        canary: Option<CanaryRouter>,
    ) -> Self {
        Self {
            services: HashMap::new(),
            balancers: HashMap::new(),
            strategy,
            breaker_config,
            canary,
        }
    }

    /// Adds an instance built from `descriptor`.
    ///
    /// # Errors
    /// [`StratumError::Registration`] for malformed descriptors and duplicate ids.
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<ServiceInstance> {
        descriptor.validate().map_err(StratumError::Registration)?;

        let id = descriptor
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", descriptor.name, Uuid::new_v4().simple()));
        let name = descriptor.name.clone();

        let records = self.services.entry(name.clone()).or_default();
        if records.iter().any(|r| r.instance.id == id) {
            return Err(StratumError::Registration(format!(
                "instance {} is already registered for service {}",
                id, name
            )));
        }

        let instance = ServiceInstance::from_descriptor(descriptor, id, SystemTime::now());
        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}/{}", name, instance.id),
            self.breaker_config.clone(),
        ));
        records.push(InstanceRecord {
            instance: instance.clone(),
            breaker,
            last_seen: Instant::now(),
            monitor: None,
        });

        let strategy = self.strategy;
        self.balancers
            .entry(name)
            .or_insert_with(|| LoadBalancer::new(strategy));
        Ok(instance)
    }

    /// Removes an instance and hands back its record so the caller can stop its monitor.
    pub fn unregister(&mut self, name: &str, id: &str) -> Option<InstanceRecord> {
        let records = self.services.get_mut(name)?;
        let index = records.iter().position(|r| r.instance.id == id)?;
        let record = records.remove(index);
        if let Some(balancer) = self.balancers.get_mut(name) {
            balancer.remove_instance(id);
        }
        self.drop_if_empty(name);
        Some(record)
    }

    fn drop_if_empty(&mut self, name: &str) {
        if self.services.get(name).is_some_and(|records| records.is_empty()) {
            self.services.remove(name);
            self.balancers.remove(name);
        }
    }

    /// Healthy instances of `name`, optionally restricted to one version.
    ///
    /// Without a version filter the result passes through the canary router.
    pub fn discover(&self, name: &str, version: Option<&str>) -> Vec<ServiceInstance> {
        let Some(records) = self.services.get(name) else {
            return Vec::new();
        };
        let healthy: Vec<ServiceInstance> = records
            .iter()
            .filter(|r| r.instance.is_healthy)
            .filter(|r| version.map_or(true, |v| r.instance.version == v))
            .map(|r| r.instance.clone())
            .collect();

        match (&self.canary, version) {
            (Some(router), None) => router.route(healthy),
            _ => healthy,
        }
    }

    /// Selects the next instance of `name` with the service's balancer.
    pub fn next_instance(&mut self, name: &str) -> Option<ServiceInstance> {
        let records = self.services.get(name)?;
        let candidates: Vec<&ServiceInstance> = records
            .iter()
            .filter(|r| r.is_routable())
            .map(|r| &r.instance)
            .collect();
        let candidates = match &self.canary {
            Some(router) => router.route(candidates),
            None => candidates,
        };
        let balancer = self.balancers.get_mut(name)?;
        balancer.pick(&candidates).cloned()
    }

    /// Returns a least-connections slot taken by [`next_instance`](Self::next_instance).
    pub fn release(&mut self, name: &str, id: &str) {
        if let Some(balancer) = self.balancers.get_mut(name) {
            balancer.release(id);
        }
    }

    /// The registry entry for one instance, monitor handle included.
    pub fn record(&self, name: &str, id: &str) -> Option<&InstanceRecord> {
        self.services.get(name)?.iter().find(|r| r.instance.id == id)
    }

    fn record_mut(&mut self, name: &str, id: &str) -> Option<&mut InstanceRecord> {
        self.services
            .get_mut(name)?
            .iter_mut()
            .find(|r| r.instance.id == id)
    }

    /// Looks up a registered instance.
    pub fn instance(&self, name: &str, id: &str) -> Option<&ServiceInstance> {
        self.record(name, id).map(|r| &r.instance)
    }

    /// Shared handle to the instance's circuit breaker.
    pub fn breaker(&self, name: &str, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.record(name, id).map(|r| r.breaker.clone())
    }

    /// Applies a probe result. Returns `Some(true)` when the health flag flipped,
    /// `None` when the instance is gone.
    pub fn apply_health(&mut self, name: &str, id: &str, status: &HealthCheckStatus) -> Option<bool> {
        let record = self.record_mut(name, id)?;
        let healthy = status.is_healthy();
        if healthy {
            record.touch();
        }
        let flipped = record.instance.is_healthy != healthy;
        record.instance.is_healthy = healthy;
        Some(flipped)
    }

    /// Refreshes an instance's liveness timestamp.
    pub fn heartbeat(&mut self, name: &str, id: &str) -> bool {
        match self.record_mut(name, id) {
            Some(record) => {
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Folds a completed call into the instance counters.
    pub fn record_call(&mut self, name: &str, id: &str, success: bool, elapsed_ms: f64) {
        if let Some(record) = self.record_mut(name, id) {
            record.instance.metrics.record(success, elapsed_ms);
            if success {
                record.touch();
            }
        }
    }

    /// Removes every instance not seen for longer than `ttl`.
    pub fn expire(&mut self, ttl: Duration) -> Vec<InstanceRecord> {
        let mut expired = Vec::new();
        let mut touched = Vec::new();
        for (name, records) in self.services.iter_mut() {
            let before = expired.len();
            let mut index = 0;
            while index < records.len() {
                if records[index].last_seen.elapsed() > ttl {
                    expired.push(records.remove(index));
                } else {
                    index += 1;
                }
            }
            if expired.len() > before {
                touched.push(name.clone());
            }
        }
        for name in &touched {
            if let Some(balancer) = self.balancers.get_mut(name) {
                for record in expired.iter().filter(|r| &r.instance.name == name) {
                    balancer.remove_instance(&record.instance.id);
                }
            }
            self.drop_if_empty(name);
        }
        expired
    }

    /// `(name, id)` of every instance with a health endpoint.
    pub fn monitored_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .services
            .values()
            .flatten()
            .filter(|r| r.instance.health_endpoint.is_some())
            .map(|r| (r.instance.name.clone(), r.instance.id.clone()))
            .collect();
        keys.sort();
        keys
    }

    /// Records with a health endpoint but no running monitor.
    pub fn unmonitored_mut(&mut self) -> impl Iterator<Item = &mut InstanceRecord> {
        self.services
            .values_mut()
            .flatten()
            .filter(|r| r.instance.health_endpoint.is_some() && r.monitor.is_none())
    }

    pub fn set_monitor(&mut self, name: &str, id: &str, monitor: TaskHandle) -> bool {
        match self.record_mut(name, id) {
            Some(record) => {
                record.monitor = Some(monitor);
                true
            }
            None => false,
        }
    }

    /// Detaches every running monitor.
    pub fn take_monitors(&mut self) -> Vec<TaskHandle> {
        self.services
            .values_mut()
            .flatten()
            .filter_map(|r| r.monitor.take())
            .collect()
    }

    /// Removes everything.
    pub fn clear(&mut self) -> Vec<InstanceRecord> {
        self.balancers.clear();
        self.services.drain().flat_map(|(_, records)| records).collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.services
            .iter()
            .map(|(name, records)| {
                (name.clone(), records.iter().map(|r| r.instance.clone()).collect())
            })
            .collect()
    }

    pub fn service_metrics(&self) -> Vec<(String, ServiceMetrics)> {
        self.service_names()
            .into_iter()
            .filter_map(|name| {
                let records = self.services.get(&name)?;
                let canary = records.iter().filter(|r| r.instance.is_canary()).count();
                let instances = records
                    .iter()
                    .map(|r| InstanceSnapshot {
                        id: r.instance.id.clone(),
                        version: r.instance.version.clone(),
                        address: r.instance.address.clone(),
                        is_healthy: r.instance.is_healthy,
                        metrics: r.instance.metrics.clone(),
                        circuit_breaker: r.breaker.get_metrics(),
                    })
                    .collect();
                let balancer = self.balancers.get(&name).map(LoadBalancer::snapshot);
                Some((name, ServiceMetrics::from_instances(instances, canary, balancer)))
            })
            .collect()
    }
}
