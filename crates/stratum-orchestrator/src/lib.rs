//! Service orchestration core.
//!
//! The [`Orchestrator`] keeps a registry of service instances and routes
//! traffic across them:
//!
//! - instances expire when not seen for the configured TTL
//! - healthy instances are selected per service by a [`LoadBalancer`]
//! - every call goes through the instance's [`CircuitBreaker`]
//! - canary versions receive a configurable share of discovery results
//! - subscribers are notified of every membership or health change

pub mod canary;
pub mod circuit_breaker;
pub mod config;
pub mod health_checker;
pub mod load_balancer;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod subscription;
pub mod transport;

pub use canary::CanaryRouter;
pub use circuit_breaker::CircuitBreaker;
pub use config::{CircuitBreakerConfig, LoadBalancingStrategy, OrchestratorConfig};
pub use health_checker::{AlwaysHealthy, HealthCheck, HealthCheckStatus, HealthChecker};
pub use load_balancer::LoadBalancer;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use subscription::{SubscribeOptions, SubscriptionId};
pub use transport::Transport;
