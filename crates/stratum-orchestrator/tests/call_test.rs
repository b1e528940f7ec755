//! Calls through the orchestrator: circuit breaking, timeouts, metrics and
//! connection accounting.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratum_common::{CircuitState, DownstreamError, ServiceDescriptor, ServiceInstance, StratumError};
use stratum_orchestrator::{
    CircuitBreakerConfig, LoadBalancingStrategy, Orchestrator, OrchestratorConfig, Transport,
};

// ============================================================================
// Mock transport
// ============================================================================

#[derive(Clone, Default)]
struct ScriptedTransport {
    failing: Arc<Mutex<HashSet<String>>>,
    slow: Arc<Mutex<HashSet<String>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    fn fail(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    fn recover(&self, id: &str) {
        self.failing.lock().remove(id);
    }

    fn stall(&self, id: &str) {
        self.slow.lock().insert(id.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn invoke(&self, instance: &ServiceInstance, payload: Value) -> Result<Value, DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stalled = self.slow.lock().contains(&instance.id);
        if stalled {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.failing.lock().contains(&instance.id) {
            return Err(DownstreamError::with_code("UNAVAILABLE", "backend down"));
        }
        if payload.get("missing").is_some() {
            return Err(DownstreamError::with_code("NOT_FOUND", "no such record"));
        }
        Ok(json!({ "instance": instance.id, "echo": payload }))
    }
}

async fn orchestrator_with(
    config: OrchestratorConfig,
    transport: &ScriptedTransport,
    ids: &[&str],
) -> Orchestrator {
    let orchestrator = Orchestrator::builder(config)
        .transport(transport.clone())
        .build()
        .unwrap();
    for id in ids {
        assert!(orchestrator
            .register_service(ServiceDescriptor::new("x", "1.0", format!("{}:80", id)).with_id(*id))
            .await);
    }
    orchestrator
}

async fn instance(orchestrator: &Orchestrator, id: &str) -> ServiceInstance {
    orchestrator.get_all_services().await["x"]
        .iter()
        .find(|i| i.id == id)
        .cloned()
        .unwrap()
}

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(3)
        .with_recovery_timeout(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(1))
}

// ============================================================================
// Basic calls
// ============================================================================

#[tokio::test]
async fn test_call_requires_transport_and_known_instance() {
    let orchestrator = Orchestrator::new(OrchestratorConfig::default()).unwrap();
    orchestrator
        .register_service(ServiceDescriptor::new("x", "1.0", "a:80").with_id("a"))
        .await;
    let a = instance(&orchestrator, "a").await;
    assert!(matches!(
        orchestrator.call_service(&a, json!({})).await,
        Err(StratumError::NoTransport)
    ));

    let transport = ScriptedTransport::default();
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), &transport, &[]).await;
    assert!(matches!(
        orchestrator.call_service(&a, json!({})).await,
        Err(StratumError::UnknownInstance { .. })
    ));
    assert!(matches!(
        orchestrator.call_service_by_name("x", json!({})).await,
        Err(StratumError::NoInstanceAvailable { .. })
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_successful_calls_update_metrics() {
    let transport = ScriptedTransport::default();
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), &transport, &["a"]).await;

    for n in 0..3 {
        let response = orchestrator
            .call_service_by_name("x", json!({ "n": n }))
            .await
            .unwrap();
        assert_eq!(response["instance"], "a");
        assert_eq!(response["echo"]["n"], n);
    }

    let metrics = orchestrator.get_metrics().await;
    let snapshot = &metrics.services["x"].instances[0];
    assert_eq!(snapshot.metrics.requests, 3);
    assert_eq!(snapshot.metrics.successes, 3);
    assert_eq!(snapshot.metrics.failures, 0);
    assert_eq!(snapshot.circuit_breaker.state, CircuitState::Closed);
}

// ============================================================================
// Circuit breaking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_rejects_and_recovers() {
    let transport = ScriptedTransport::default();
    let config = OrchestratorConfig::default().with_circuit_breaker(breaker_config());
    let orchestrator = orchestrator_with(config, &transport, &["a", "b"]).await;
    let a = instance(&orchestrator, "a").await;
    transport.fail("a");

    for _ in 0..3 {
        assert!(matches!(
            orchestrator.call_service(&a, json!({})).await,
            Err(StratumError::CallFailed { .. })
        ));
    }

    let rejected = orchestrator.call_service(&a, json!({})).await;
    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(transport.calls(), 3);

    let metrics = orchestrator.get_metrics().await;
    let breaker = &metrics.services["x"].instances[0].circuit_breaker;
    assert_eq!(breaker.state, CircuitState::Open);
    assert_eq!(breaker.failure_count, 3);
    assert_eq!(breaker.rejected_calls, 1);

    // Open breakers are skipped by selection
    for _ in 0..4 {
        assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "b");
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    transport.recover("a");
    orchestrator.call_service(&a, json!({})).await.unwrap();

    let metrics = orchestrator.get_metrics().await;
    let breaker = &metrics.services["x"].instances[0].circuit_breaker;
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
}

#[tokio::test]
async fn test_failure_rate_from_mixed_outcomes() {
    let transport = ScriptedTransport::default();
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), &transport, &["a"]).await;
    let a = instance(&orchestrator, "a").await;

    for _ in 0..7 {
        orchestrator.call_service(&a, json!({})).await.unwrap();
    }
    transport.fail("a");
    for _ in 0..3 {
        assert!(orchestrator.call_service(&a, json!({})).await.is_err());
    }

    let metrics = orchestrator.get_metrics().await;
    let snapshot = &metrics.services["x"].instances[0];
    assert_eq!(snapshot.circuit_breaker.failure_rate, 30.0);
    assert_eq!(snapshot.circuit_breaker.state, CircuitState::Closed);
    assert_eq!(snapshot.metrics.requests, 10);
    assert_eq!(snapshot.metrics.failures, 3);
}

#[tokio::test]
async fn test_expected_errors_do_not_trip_the_breaker() {
    let transport = ScriptedTransport::default();
    let breaker = breaker_config()
        .with_expected_error(|e: &DownstreamError| e.code.as_deref() == Some("NOT_FOUND"));
    let config = OrchestratorConfig::default().with_circuit_breaker(breaker);
    let orchestrator = orchestrator_with(config, &transport, &["a"]).await;
    let a = instance(&orchestrator, "a").await;

    for _ in 0..5 {
        match orchestrator.call_service(&a, json!({ "missing": true })).await {
            Err(StratumError::Downstream(e)) => assert_eq!(e.code.as_deref(), Some("NOT_FOUND")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    let metrics = orchestrator.get_metrics().await;
    assert_eq!(
        metrics.services["x"].instances[0].circuit_breaker.state,
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_call_times_out() {
    let transport = ScriptedTransport::default();
    let config = OrchestratorConfig::default().with_circuit_breaker(breaker_config());
    let orchestrator = orchestrator_with(config, &transport, &["a"]).await;
    let a = instance(&orchestrator, "a").await;
    transport.stall("a");

    match orchestrator.call_service(&a, json!({})).await {
        Err(StratumError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 1000),
        other => panic!("unexpected result: {:?}", other),
    }
    let metrics = orchestrator.get_metrics().await;
    assert_eq!(metrics.services["x"].instances[0].metrics.failures, 1);
}

#[tokio::test]
async fn test_force_open_and_reset_circuit() {
    let transport = ScriptedTransport::default();
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), &transport, &["a"]).await;
    let a = instance(&orchestrator, "a").await;

    assert!(orchestrator.force_open_circuit("x", "a").await);
    assert!(orchestrator.call_service(&a, json!({})).await.unwrap_err().is_circuit_open());
    assert!(orchestrator.get_next_instance("x").await.is_none());

    assert!(orchestrator.reset_circuit("x", "a").await);
    orchestrator.call_service(&a, json!({})).await.unwrap();

    assert!(!orchestrator.force_open_circuit("x", "nope").await);
    assert!(!orchestrator.reset_circuit("y", "a").await);
}

#[tokio::test]
async fn test_disabled_breaker_never_rejects() {
    let transport = ScriptedTransport::default();
    let config = OrchestratorConfig::default()
        .with_circuit_breaker_enabled(false)
        .with_circuit_breaker(breaker_config());
    let orchestrator = orchestrator_with(config, &transport, &["a"]).await;
    let a = instance(&orchestrator, "a").await;
    transport.fail("a");

    for _ in 0..10 {
        assert!(matches!(
            orchestrator.call_service(&a, json!({})).await,
            Err(StratumError::CallFailed { .. })
        ));
    }
    assert_eq!(transport.calls(), 10);
}

// ============================================================================
// Connection accounting
// ============================================================================

async fn connection_counts(orchestrator: &Orchestrator) -> (usize, usize) {
    let metrics = orchestrator.get_metrics().await;
    let counts = metrics.services["x"]
        .load_balancer
        .as_ref()
        .and_then(|lb| lb.connection_counts.clone())
        .unwrap();
    (
        counts.get("a").copied().unwrap_or(0),
        counts.get("b").copied().unwrap_or(0),
    )
}

#[tokio::test]
async fn test_least_connections_release() {
    let transport = ScriptedTransport::default();
    let config = OrchestratorConfig::default().with_strategy(LoadBalancingStrategy::LeastConnections);
    let orchestrator = orchestrator_with(config, &transport, &["a", "b"]).await;

    assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "a");
    assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "b");

    orchestrator.release_connection("x", "a").await;
    assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "a");
    assert_eq!(connection_counts(&orchestrator).await, (1, 1));

    // call by name reserves a slot for the call and returns it afterwards
    orchestrator.call_service_by_name("x", json!({})).await.unwrap();
    assert_eq!(connection_counts(&orchestrator).await, (1, 1));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_direct_call_keeps_reserved_slots() {
    let transport = ScriptedTransport::default();
    let config = OrchestratorConfig::default().with_strategy(LoadBalancingStrategy::LeastConnections);
    let orchestrator = orchestrator_with(config, &transport, &["a", "b"]).await;

    // another caller holds a slot on "a"
    assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "a");

    // a discovered instance was never reserved, so calling it releases nothing
    let discovered = instance(&orchestrator, "a").await;
    orchestrator.call_service(&discovered, json!({})).await.unwrap();
    orchestrator.call_service(&discovered, json!({})).await.unwrap();
    assert_eq!(connection_counts(&orchestrator).await, (1, 0));

    // the reserved slot still steers the next pick away from "a"
    assert_eq!(orchestrator.get_next_instance("x").await.unwrap().id, "b");

    orchestrator.release_connection("x", "a").await;
    assert_eq!(connection_counts(&orchestrator).await, (0, 1));
}
