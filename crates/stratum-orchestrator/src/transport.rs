use async_trait::async_trait;
use serde_json::Value;
use stratum_common::{DownstreamError, ServiceInstance};

/// Invokes a downstream instance.
///
/// How the payload reaches the instance (HTTP, gRPC, in-process) is up to the
/// embedding application. Returned errors are classified by the instance's
/// circuit breaker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, instance: &ServiceInstance, payload: Value) -> Result<Value, DownstreamError>;
}
