use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stratum_common::error::{Result, StratumError};
use stratum_common::DownstreamError;

/// Load balancing strategy selected for every service name.
///
/// Parsing never fails: unrecognized names fall back to round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::Weighted => "weighted",
            LoadBalancingStrategy::LeastConnections => "least-connections",
            LoadBalancingStrategy::Random => "random",
        }
    }

    /// Parses a strategy name, accepting `-`, `_` and case variations.
    pub fn parse_lenient(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "weighted" => LoadBalancingStrategy::Weighted,
            "least-connections" | "leastconnections" => LoadBalancingStrategy::LeastConnections,
            "random" => LoadBalancingStrategy::Random,
            _ => LoadBalancingStrategy::RoundRobin,
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

impl From<String> for LoadBalancingStrategy {
    fn from(s: String) -> Self {
        Self::parse_lenient(&s)
    }
}

impl From<LoadBalancingStrategy> for String {
    fn from(strategy: LoadBalancingStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate marking downstream errors as business errors that should not
/// count against a circuit breaker.
pub type ExpectedErrorPredicate = Arc<dyn Fn(&DownstreamError) -> bool + Send + Sync>;

/// Circuit breaker configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before tripping the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting trial calls (ms)
    pub recovery_timeout_ms: u64,
    /// Maximum number of concurrent trial calls while half-open
    pub half_open_max_calls: u32,
    /// Enforced per-call timeout (ms)
    pub timeout_ms: u64,
    /// Errors matching this predicate pass through without tripping the breaker
    #[serde(skip)]
    pub expected_error: Option<ExpectedErrorPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 3,
            timeout_ms: 30_000,
            expected_error: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout_ms", &self.recovery_timeout_ms)
            .field("half_open_max_calls", &self.half_open_max_calls)
            .field("timeout_ms", &self.timeout_ms)
            .field("expected_error", &self.expected_error.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_expected_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DownstreamError) -> bool + Send + Sync + 'static,
    {
        self.expected_error = Some(Arc::new(predicate));
        self
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_expected(&self, error: &DownstreamError) -> bool {
        self.expected_error
            .as_ref()
            .map(|predicate| predicate(error))
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(StratumError::InvalidConfig(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(StratumError::InvalidConfig(
                "circuit_breaker.half_open_max_calls must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(StratumError::InvalidConfig(
                "circuit_breaker.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator configuration.
///
/// Every field has a default, so a JSON config file only needs the keys it
/// wants to change:
///
/// ```
/// use stratum_orchestrator::{OrchestratorConfig, LoadBalancingStrategy};
///
/// let config: OrchestratorConfig =
///     serde_json::from_str(r#"{"region": "eu-west", "strategy": "least-connections"}"#).unwrap();
/// assert_eq!(config.strategy, LoadBalancingStrategy::LeastConnections);
/// assert_eq!(config.canary_traffic_percentage, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub region: String,
    pub strategy: LoadBalancingStrategy,
    pub enable_health_checks: bool,
    pub enable_circuit_breaker: bool,
    pub enable_canary: bool,
    pub enable_metrics: bool,
    /// Instances not seen for this long are purged by the expiry sweep
    pub service_ttl_ms: u64,
    /// Interval of the expiry sweep
    pub cleanup_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    /// When set, one task probes this many instances per tick in rotation
    /// instead of running one task per instance.
    pub health_check_batch_size: Option<usize>,
    pub metrics_interval_ms: u64,
    /// Share of traffic (0-100) routed to canary instances
    pub canary_traffic_percentage: u8,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            strategy: LoadBalancingStrategy::RoundRobin,
            enable_health_checks: true,
            enable_circuit_breaker: true,
            enable_canary: true,
            enable_metrics: true,
            service_ttl_ms: 300_000,
            cleanup_interval_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            health_check_batch_size: None,
            metrics_interval_ms: 10_000,
            canary_traffic_percentage: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.enable_health_checks = enabled;
        self
    }

    pub fn with_circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = enabled;
        self
    }

    pub fn with_canary(mut self, enabled: bool) -> Self {
        self.enable_canary = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn with_service_ttl(mut self, ttl: Duration) -> Self {
        self.service_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check_batch_size(mut self, batch_size: usize) -> Self {
        self.health_check_batch_size = Some(batch_size);
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_canary_traffic_percentage(mut self, percentage: u8) -> Self {
        self.canary_traffic_percentage = percentage;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn service_ttl(&self) -> Duration {
        Duration::from_millis(self.service_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Rejects values that would make periodic tasks spin or routing meaningless.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("service_ttl_ms", self.service_ttl_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(StratumError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.canary_traffic_percentage > 100 {
            return Err(StratumError::InvalidConfig(format!(
                "canary_traffic_percentage must be between 0 and 100, got {}",
                self.canary_traffic_percentage
            )));
        }
        if self.health_check_batch_size == Some(0) {
            return Err(StratumError::InvalidConfig(
                "health_check_batch_size must be at least 1".to_string(),
            ));
        }
        self.circuit_breaker.validate()
    }
}
