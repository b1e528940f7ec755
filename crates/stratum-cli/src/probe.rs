use async_trait::async_trait;
use stratum_common::{DownstreamError, ServiceInstance};
use stratum_orchestrator::HealthCheck;
use tokio::net::TcpStream;

/// Health check that opens a TCP connection to the instance's health endpoint.
///
/// Accepts `host:port` as well as URLs such as `http://host:port/health`; the
/// scheme and path are ignored. Instances without an endpoint are probed at
/// their service address.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectCheck;

impl TcpConnectCheck {
    pub fn new() -> Self {
        Self
    }
}

/// Extracts `host:port` from an endpoint.
pub fn socket_target(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

#[async_trait]
impl HealthCheck for TcpConnectCheck {
    async fn check(&self, instance: &ServiceInstance) -> Result<bool, DownstreamError> {
        let endpoint = instance
            .health_endpoint
            .as_deref()
            .unwrap_or(&instance.address);
        let target = socket_target(endpoint);
        match TcpStream::connect(target).await {
            Ok(_) => Ok(true),
            Err(e) => Err(DownstreamError::with_code(
                "CONNECT",
                format!("{}: {}", target, e),
            )),
        }
    }
}
