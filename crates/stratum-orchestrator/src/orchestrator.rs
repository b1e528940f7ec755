use crate::canary::CanaryRouter;
use crate::config::OrchestratorConfig;
use crate::health_checker::{AlwaysHealthy, HealthCheck, HealthCheckStatus, HealthChecker, HealthRotation};
use crate::registry::ServiceRegistry;
use crate::scheduler::{cancel_all, spawn_periodic, TaskHandle};
use crate::subscription::{SubscribeOptions, SubscriptionHub, SubscriptionId};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stratum_common::error::{Result, StratumError};
use stratum_common::{ServiceDescriptor, ServiceInstance};
use stratum_metrics::{MetricsSink, OrchestratorMetrics, TracingMetricsSink};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builder for [`Orchestrator`].
///
/// Every collaborator has a default: health probes report healthy, metrics are
/// logged through `tracing`, and no transport is installed (so
/// [`Orchestrator::call_service`] fails with [`StratumError::NoTransport`]).
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    health_check: Arc<dyn HealthCheck>,
    transport: Option<Arc<dyn Transport>>,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            health_check: Arc::new(AlwaysHealthy),
            transport: None,
            metrics_sink: Arc::new(TracingMetricsSink::new()),
        }
    }

    pub fn health_check(mut self, check: impl HealthCheck + 'static) -> Self {
        self.health_check = Arc::new(check);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    /// Validates the configuration and assembles the orchestrator.
    ///
    /// # Errors
    /// [`StratumError::InvalidConfig`] when the configuration is rejected.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let canary = self
            .config
            .enable_canary
            .then(|| CanaryRouter::new(self.config.canary_traffic_percentage));
        let registry = ServiceRegistry::new(
            self.config.strategy,
            self.config.circuit_breaker.clone(),
            canary,
        );
        let health = HealthChecker::new(self.health_check, self.config.health_check_timeout());

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                registry: RwLock::new(registry),
                hub: SubscriptionHub::new(),
                health,
                transport: self.transport,
                metrics_sink: self.metrics_sink,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
            }),
        })
    }
}

/// Service orchestration façade.
///
/// Owns the registry, the subscription hub and every background task:
/// health monitoring, TTL expiry and periodic metrics emission. The
/// orchestrator is cheap to clone; clones share the same state.
///
/// # Lifecycle
///
/// Registration, discovery and calls work whether or not the orchestrator is
/// started. [`start`](Self::start) launches the background tasks and
/// [`stop`](Self::stop) cancels all of them; both are idempotent and the pair
/// can be repeated. Dropping the last clone aborts any task still running.
///
/// # Example
/// ```no_run
/// # use stratum_orchestrator::{Orchestrator, OrchestratorConfig};
/// # use stratum_common::ServiceDescriptor;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
/// orchestrator.start().await;
///
/// orchestrator
///     .register_service(ServiceDescriptor::new("payments", "1.4.0", "10.0.0.7:8080"))
///     .await;
/// let next = orchestrator.get_next_instance("payments").await;
/// assert!(next.is_some());
///
/// orchestrator.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: RwLock<ServiceRegistry>,
    hub: SubscriptionHub,
    health: HealthChecker,
    transport: Option<Arc<dyn Transport>>,
    metrics_sink: Arc<dyn MetricsSink>,
    /// Global periodic tasks; per-instance monitors live on registry records
    tasks: Mutex<Vec<TaskHandle>>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Orchestrator {
    /// Creates an orchestrator with default collaborators.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        OrchestratorBuilder::new(config).build()
    }

    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Launches the background tasks. Calling it while running is a no-op.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            debug!("Orchestrator already running");
            return;
        }
        *self.inner.started_at.lock() = Some(Instant::now());
        let config = &self.inner.config;

        let mut tasks = vec![spawn_task(
            &self.inner,
            "expiry-sweep",
            config.cleanup_interval(),
            |inner| async move { inner.sweep_expired().await },
        )];

        if config.enable_metrics {
            tasks.push(spawn_task(
                &self.inner,
                "metrics",
                config.metrics_interval(),
                |inner| async move { inner.emit_metrics().await },
            ));
        }

        if config.enable_health_checks {
            match config.health_check_batch_size {
                Some(batch_size) => {
                    let rotation = Arc::new(Mutex::new(HealthRotation::new(batch_size)));
                    tasks.push(spawn_task(
                        &self.inner,
                        "health-sweep",
                        config.health_check_interval(),
                        move |inner| {
                            let rotation = rotation.clone();
                            async move { inner.check_batch(&rotation).await }
                        },
                    ));
                }
                None => {
                    let mut registry = self.inner.registry.write().await;
                    for record in registry.unmonitored_mut() {
                        record.monitor = Some(spawn_monitor(
                            &self.inner,
                            &record.instance.name,
                            &record.instance.id,
                        ));
                    }
                }
            }
        }

        self.inner.tasks.lock().extend(tasks);
        info!(
            region = %config.region,
            strategy = %config.strategy,
            "Orchestrator started"
        );
    }

    /// Cancels every background task and waits for them to finish.
    ///
    /// Registered instances and subscriptions are kept. Calling it while
    /// stopped is a no-op.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut handles: Vec<TaskHandle> = self.inner.tasks.lock().drain(..).collect();
        handles.extend(self.inner.registry.write().await.take_monitors());
        let count = handles.len();
        cancel_all(&mut handles).await;
        *self.inner.started_at.lock() = None;
        info!(tasks = count, "Orchestrator stopped");
    }

    /// Registers an instance. Returns false (and logs why) when the
    /// descriptor is rejected.
    pub async fn register_service(&self, descriptor: ServiceDescriptor) -> bool {
        let name = descriptor.name.clone();
        match self.try_register_service(descriptor).await {
            Ok(_) => true,
            Err(e) => {
                warn!(service = %name, error = %e, "Registration rejected");
                false
            }
        }
    }

    /// Registers an instance and returns it with its assigned id.
    ///
    /// # Errors
    /// [`StratumError::Registration`] for malformed descriptors and duplicate ids.
    pub async fn try_register_service(&self, descriptor: ServiceDescriptor) -> Result<ServiceInstance> {
        let mut registry = self.inner.registry.write().await;
        let instance = registry.register(descriptor)?;

        if self.inner.monitors_per_instance() && instance.health_endpoint.is_some() {
            let monitor = spawn_monitor(&self.inner, &instance.name, &instance.id);
            registry.set_monitor(&instance.name, &instance.id, monitor);
        }

        info!(
            service = %instance.name,
            instance = %instance.id,
            version = %instance.version,
            address = %instance.address,
            "Registered service instance"
        );
        self.inner.publish(&registry, &instance.name);
        Ok(instance)
    }

    /// Removes an instance and stops its health monitor.
    pub async fn unregister_service(&self, name: &str, id: &str) -> bool {
        let record = {
            let mut registry = self.inner.registry.write().await;
            let record = registry.unregister(name, id);
            if record.is_some() {
                self.inner.publish(&registry, name);
            }
            record
        };

        match record {
            Some(record) => {
                if let Some(mut monitor) = record.monitor {
                    monitor.cancel().await;
                }
                info!(service = %name, instance = %id, "Unregistered service instance");
                true
            }
            None => {
                debug!(service = %name, instance = %id, "Unregister for unknown instance");
                false
            }
        }
    }

    /// Healthy instances of `name`, optionally restricted to one version.
    ///
    /// Without a version filter and with canary routing enabled, stable and
    /// canary instances are mixed according to the canary traffic share.
    pub async fn discover_service(&self, name: &str, version: Option<&str>) -> Vec<ServiceInstance> {
        self.inner.registry.read().await.discover(name, version)
    }

    /// Picks the next instance of `name` with the configured strategy.
    ///
    /// Unhealthy instances and instances whose circuit is open inside its
    /// recovery window are skipped. With least-connections the pick reserves a
    /// connection slot, released by [`release_connection`](Self::release_connection)
    /// (or automatically by [`call_service_by_name`](Self::call_service_by_name)).
    pub async fn get_next_instance(&self, name: &str) -> Option<ServiceInstance> {
        let picked = self.inner.registry.write().await.next_instance(name);
        if picked.is_none() {
            debug!(service = %name, "No routable instance");
        }
        picked
    }

    /// Returns a connection slot taken by [`get_next_instance`](Self::get_next_instance).
    pub async fn release_connection(&self, name: &str, id: &str) {
        self.inner.registry.write().await.release(name, id);
    }

    /// Refreshes the liveness timestamp of an instance.
    pub async fn heartbeat(&self, name: &str, id: &str) -> bool {
        self.inner.registry.write().await.heartbeat(name, id)
    }

    /// Invokes `instance` through its circuit breaker.
    ///
    /// Instance metrics are updated whatever the outcome. No least-connections
    /// slot is released here: `instance` may come from discovery rather than
    /// [`get_next_instance`](Self::get_next_instance).
    ///
    /// # Errors
    /// - [`StratumError::NoTransport`] without a transport
    /// - [`StratumError::UnknownInstance`] when the instance is not registered
    /// - breaker errors: [`StratumError::CircuitOpen`], [`StratumError::Timeout`],
    ///   [`StratumError::CallFailed`] or [`StratumError::Downstream`]
    pub async fn call_service(&self, instance: &ServiceInstance, payload: Value) -> Result<Value> {
        let transport = self.inner.transport.clone().ok_or(StratumError::NoTransport)?;
        let breaker = self
            .inner
            .registry
            .read()
            .await
            .breaker(&instance.name, &instance.id)
            .ok_or_else(|| StratumError::UnknownInstance {
                service: instance.name.clone(),
                id: instance.id.clone(),
            })?;

        let started = Instant::now();
        let result = if self.inner.config.enable_circuit_breaker {
            breaker
                .execute(|| transport.invoke(instance, payload))
                .await
        } else {
            self.inner
                .invoke_unguarded(transport.as_ref(), instance, payload, breaker.name())
                .await
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.inner
            .registry
            .write()
            .await
            .record_call(&instance.name, &instance.id, result.is_ok(), elapsed_ms);

        if let Err(e) = &result {
            debug!(
                service = %instance.name,
                instance = %instance.id,
                error = %e,
                "Service call failed"
            );
        }
        result
    }

    /// Picks an instance of `name`, calls it and returns the connection slot
    /// the pick reserved.
    ///
    /// # Errors
    /// [`StratumError::NoInstanceAvailable`] when nothing is routable, otherwise
    /// as [`call_service`](Self::call_service).
    pub async fn call_service_by_name(&self, name: &str, payload: Value) -> Result<Value> {
        let instance = self
            .get_next_instance(name)
            .await
            .ok_or_else(|| StratumError::NoInstanceAvailable {
                service: name.to_string(),
            })?;
        let result = self.call_service(&instance, payload).await;
        self.release_connection(&instance.name, &instance.id).await;
        result
    }

    /// Subscribes to membership changes of `name`.
    ///
    /// The callback fires immediately with the current view, then after every
    /// registration, removal or health flip of the service, always with the
    /// same view [`discover_service`](Self::discover_service) would return.
    pub async fn subscribe<F>(&self, name: &str, callback: F, options: SubscribeOptions) -> SubscriptionId
    where
        F: Fn(&[ServiceInstance]) + Send + Sync + 'static,
    {
        // Holding the read lock keeps mutations (and their deliveries) out
        // until the initial view has been delivered.
        let registry = self.inner.registry.read().await;
        let initial = registry.discover(name, options.version.as_deref());
        self.inner
            .hub
            .subscribe(name, Arc::new(callback), options, initial)
    }

    /// Stops deliveries to a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    pub async fn get_metrics(&self) -> OrchestratorMetrics {
        self.inner.metrics().await
    }

    /// Every registered instance, healthy or not, grouped by service.
    pub async fn get_all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.inner.registry.read().await.all_services()
    }

    /// Trips the circuit of one instance.
    pub async fn force_open_circuit(&self, name: &str, id: &str) -> bool {
        match self.inner.registry.read().await.breaker(name, id) {
            Some(breaker) => {
                breaker.force_open();
                true
            }
            None => false,
        }
    }

    /// Closes the circuit of one instance and clears its counters.
    pub async fn reset_circuit(&self, name: &str, id: &str) -> bool {
        match self.inner.registry.read().await.breaker(name, id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Runs one expiry sweep now. Returns the number of removed instances.
    pub async fn expire_stale(&self) -> usize {
        self.inner.sweep_expired_count().await
    }

    /// Stops the orchestrator and drops every instance and subscription.
    pub async fn force_cleanup(&self) {
        self.stop().await;
        let records = self.inner.registry.write().await.clear();
        let count = records.len();
        let mut monitors: Vec<TaskHandle> = records.into_iter().filter_map(|r| r.monitor).collect();
        cancel_all(&mut monitors).await;
        self.inner.hub.clear();
        info!(instances = count, "Orchestrator state cleared");
    }
}

impl Inner {
    fn monitors_per_instance(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.config.enable_health_checks
            && self.config.health_check_batch_size.is_none()
    }

    /// Re-delivers the current view of `name` to its subscribers.
    fn publish(&self, registry: &ServiceRegistry, name: &str) {
        self.hub
            .publish(name, |version| registry.discover(name, version));
    }

    async fn check_instance(&self, name: &str, id: &str) {
        let Some(instance) = self.registry.read().await.instance(name, id).cloned() else {
            return;
        };
        let status = self.health.probe(&instance).await;

        let mut registry = self.registry.write().await;
        if registry.apply_health(name, id, &status) != Some(true) {
            return;
        }
        match &status {
            HealthCheckStatus::Healthy => {
                info!(service = %name, instance = %id, "Instance recovered");
            }
            HealthCheckStatus::Unhealthy(reason) => {
                warn!(service = %name, instance = %id, reason = %reason, "Instance marked unhealthy");
            }
        }
        self.publish(&registry, name);
    }

    async fn check_batch(&self, rotation: &Mutex<HealthRotation>) {
        let keys = self.registry.read().await.monitored_keys();
        let batch = rotation.lock().next_batch(&keys);
        join_all(batch.iter().map(|(name, id)| self.check_instance(name, id))).await;
    }

    async fn sweep_expired(&self) {
        self.sweep_expired_count().await;
    }

    async fn sweep_expired_count(&self) -> usize {
        let expired = {
            let mut registry = self.registry.write().await;
            let expired = registry.expire(self.config.service_ttl());
            let mut names: Vec<&str> = expired.iter().map(|r| r.instance.name.as_str()).collect();
            names.sort_unstable();
            names.dedup();
            for name in names {
                self.publish(&registry, name);
            }
            expired
        };

        let count = expired.len();
        for record in expired {
            info!(
                service = %record.instance.name,
                instance = %record.instance.id,
                "Expired stale instance"
            );
            if let Some(mut monitor) = record.monitor {
                monitor.cancel().await;
            }
        }
        count
    }

    async fn invoke_unguarded(
        &self,
        transport: &dyn Transport,
        instance: &ServiceInstance,
        payload: Value,
        label: &str,
    ) -> Result<Value> {
        let breaker_config = &self.config.circuit_breaker;
        match tokio::time::timeout(breaker_config.timeout(), transport.invoke(instance, payload)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if breaker_config.is_expected(&e) => Err(StratumError::Downstream(e)),
            Ok(Err(e)) => Err(StratumError::CallFailed {
                breaker: label.to_string(),
                source: e,
            }),
            Err(_) => Err(StratumError::Timeout {
                breaker: label.to_string(),
                timeout_ms: breaker_config.timeout_ms,
            }),
        }
    }

    async fn metrics(&self) -> OrchestratorMetrics {
        let uptime_ms = self
            .started_at
            .lock()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let mut metrics = OrchestratorMetrics::new(
            self.config.region.clone(),
            self.config.strategy.as_str(),
            uptime_ms,
        );
        metrics.running = self.running.load(Ordering::Acquire);
        metrics.subscriptions = self.hub.len();

        let registry = self.registry.read().await;
        for (name, service) in registry.service_metrics() {
            metrics.insert_service(name, service);
        }
        metrics
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics().await;
        self.metrics_sink.emit(&metrics);
    }
}

/// Spawns a periodic task that holds the orchestrator state only weakly, so
/// dropping the last [`Orchestrator`] tears everything down.
fn spawn_task<F, Fut>(inner: &Arc<Inner>, name: impl Into<String>, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut(Arc<Inner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    spawn_periodic(name, period, move || {
        let tick = weak.upgrade().map(&mut tick);
        async move {
            if let Some(tick) = tick {
                tick.await;
            }
        }
    })
}

fn spawn_monitor(inner: &Arc<Inner>, name: &str, id: &str) -> TaskHandle {
    let name = name.to_string();
    let id = id.to_string();
    spawn_task(
        inner,
        format!("health:{}/{}", name, id),
        inner.config.health_check_interval(),
        move |inner| {
            let name = name.clone();
            let id = id.clone();
            async move { inner.check_instance(&name, &id).await }
        },
    )
}
