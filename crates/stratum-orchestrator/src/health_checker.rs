use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stratum_common::{DownstreamError, ServiceInstance};

/// Liveness probe for one instance.
///
/// `Ok(true)` is healthy; `Ok(false)`, an error, or exceeding the probe
/// timeout all count as unhealthy.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, instance: &ServiceInstance) -> Result<bool, DownstreamError>;
}

/// Health check that reports every instance healthy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check(&self, _instance: &ServiceInstance) -> Result<bool, DownstreamError> {
        Ok(true)
    }
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthCheckStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthCheckStatus::Healthy)
    }
}

/// Runs health checks under a fixed timeout.
#[derive(Clone)]
pub struct HealthChecker {
    check: Arc<dyn HealthCheck>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(check: Arc<dyn HealthCheck>, timeout: Duration) -> Self {
        Self { check, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probes one instance; never fails, every problem maps to `Unhealthy`.
    pub async fn probe(&self, instance: &ServiceInstance) -> HealthCheckStatus {
        match tokio::time::timeout(self.timeout, self.check.check(instance)).await {
            Ok(Ok(true)) => HealthCheckStatus::Healthy,
            Ok(Ok(false)) => HealthCheckStatus::Unhealthy("check reported unhealthy".to_string()),
            Ok(Err(e)) => HealthCheckStatus::Unhealthy(e.to_string()),
            Err(_) => HealthCheckStatus::Unhealthy(format!(
                "health check timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// Picks which instances a rotating health sweep probes on each tick.
///
/// With `N` monitored instances and batch size `b`, every instance is probed
/// at least once every `ceil(N / b)` ticks, which bounds how stale its health
/// flag can get.
#[derive(Debug, Clone)]
pub struct HealthRotation {
    batch_size: usize,
    cursor: usize,
}

impl HealthRotation {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    /// Takes the next batch from `keys`, wrapping around the end.
    pub fn next_batch<T: Clone>(&mut self, keys: &[T]) -> Vec<T> {
        if keys.is_empty() {
            self.cursor = 0;
            return Vec::new();
        }
        let len = keys.len();
        let take = self.batch_size.min(len);
        let start = self.cursor % len;
        let batch = (0..take).map(|offset| keys[(start + offset) % len].clone()).collect();
        self.cursor = (start + take) % len;
        batch
    }

    /// Ticks needed to cover `instance_count` instances once.
    pub fn ticks_per_cycle(&self, instance_count: usize) -> usize {
        instance_count.div_ceil(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use stratum_common::ServiceDescriptor;

    struct Fixed(Result<bool, DownstreamError>);

    #[async_trait]
    impl HealthCheck for Fixed {
        async fn check(&self, _instance: &ServiceInstance) -> Result<bool, DownstreamError> {
            self.0.clone()
        }
    }

    struct Hangs;

    #[async_trait]
    impl HealthCheck for Hangs {
        async fn check(&self, _instance: &ServiceInstance) -> Result<bool, DownstreamError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(true)
        }
    }

    fn instance() -> ServiceInstance {
        ServiceInstance::from_descriptor(
            ServiceDescriptor::new("svc", "1.0", "127.0.0.1:1").with_health_endpoint("127.0.0.1:2"),
            "svc-1".to_string(),
            SystemTime::now(),
        )
    }

    #[tokio::test]
    async fn test_probe_outcomes() {
        let timeout = Duration::from_secs(5);
        let healthy = HealthChecker::new(Arc::new(Fixed(Ok(true))), timeout);
        assert_eq!(healthy.probe(&instance()).await, HealthCheckStatus::Healthy);

        let unhealthy = HealthChecker::new(Arc::new(Fixed(Ok(false))), timeout);
        assert!(!unhealthy.probe(&instance()).await.is_healthy());

        let failing = HealthChecker::new(Arc::new(Fixed(Err(DownstreamError::new("refused")))), timeout);
        assert_eq!(
            failing.probe(&instance()).await,
            HealthCheckStatus::Unhealthy("refused".to_string())
        );

        let default = HealthChecker::new(Arc::new(AlwaysHealthy), timeout);
        assert!(default.probe(&instance()).await.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_unhealthy() {
        let checker = HealthChecker::new(Arc::new(Hangs), Duration::from_millis(5000));
        let status = checker.probe(&instance()).await;
        assert_eq!(
            status,
            HealthCheckStatus::Unhealthy("health check timed out after 5000ms".to_string())
        );
    }

    #[test]
    fn test_rotation_covers_everything() {
        let keys = vec!["a", "b", "c", "d", "e"];
        let mut rotation = HealthRotation::new(2);
        assert_eq!(rotation.next_batch(&keys), vec!["a", "b"]);
        assert_eq!(rotation.next_batch(&keys), vec!["c", "d"]);
        assert_eq!(rotation.next_batch(&keys), vec!["e", "a"]);
        assert_eq!(rotation.ticks_per_cycle(keys.len()), 3);
    }

    #[test]
    fn test_rotation_handles_shrinking_lists() {
        let mut rotation = HealthRotation::new(3);
        rotation.next_batch(&[1, 2, 3, 4]);
        // cursor 3 wraps on a list of two
        assert_eq!(rotation.next_batch(&[1, 2]), vec![2, 1]);
        assert!(rotation.next_batch::<u32>(&[]).is_empty());
    }
}
