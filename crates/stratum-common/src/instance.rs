use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Version marker identifying a canary release (e.g. `2.1.0-canary`).
pub const CANARY_MARKER: &str = "-canary";

/// Returns true when `version` carries the canary marker.
pub fn is_canary_version(version: &str) -> bool {
    version.contains(CANARY_MARKER)
}

fn default_weight() -> u32 {
    1
}

/// What a caller supplies to register an instance.
///
/// Missing `id`s are generated at registration time. The JSON form is what the
/// CLI manifest contains:
///
/// ```json
/// { "name": "orders", "version": "1.4.0", "address": "10.0.0.7:8080",
///   "health_endpoint": "10.0.0.7:8081", "weight": 2 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    pub address: String,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: version.into(),
            address: address.into(),
            health_endpoint: None,
            weight: default_weight(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Checks the fields a registry cannot work without.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("service name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return Err(format!("service {} has an empty version", self.name));
        }
        if self.address.trim().is_empty() {
            return Err(format!("service {} has an empty address", self.name));
        }
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err(format!("service {} has an empty instance id", self.name));
        }
        Ok(())
    }
}

/// Call counters kept per instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_response_time_ms: f64,
}

impl InstanceMetrics {
    /// Folds one completed call into the counters, keeping a running mean.
    pub fn record(&mut self, success: bool, elapsed_ms: f64) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.requests as f64;
        self.average_response_time_ms += (elapsed_ms - self.average_response_time_ms) / n;
    }
}

/// Immutable view of a registered instance.
///
/// Registries hand these out by value; mutating one never touches registry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub address: String,
    pub health_endpoint: Option<String>,
    pub weight: u32,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub registered_at: SystemTime,
    pub last_health_check: SystemTime,
    pub is_healthy: bool,
    pub metrics: InstanceMetrics,
}

impl ServiceInstance {
    /// Builds the full record from a descriptor whose id has been resolved.
    pub fn from_descriptor(descriptor: ServiceDescriptor, id: String, now: SystemTime) -> Self {
        Self {
            id,
            name: descriptor.name,
            version: descriptor.version,
            address: descriptor.address,
            health_endpoint: descriptor.health_endpoint,
            weight: descriptor.weight,
            tags: descriptor.tags,
            metadata: descriptor.metadata,
            registered_at: now,
            last_health_check: now,
            is_healthy: true,
            metrics: InstanceMetrics::default(),
        }
    }

    pub fn is_canary(&self) -> bool {
        is_canary_version(&self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_marker() {
        assert!(is_canary_version("2.0.0-canary"));
        assert!(is_canary_version("2.0.0-canary.3"));
        assert!(!is_canary_version("2.0.0"));
        assert!(!is_canary_version("canary"));
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let descriptor: ServiceDescriptor = serde_json::from_str(
            r#"{"name": "orders", "version": "1.0.0", "address": "10.0.0.1:80"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.weight, 1);
        assert!(descriptor.id.is_none());
        assert!(descriptor.health_endpoint.is_none());
        assert!(descriptor.tags.is_empty());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(ServiceDescriptor::new("orders", "1.0", "a:1").validate().is_ok());
        assert!(ServiceDescriptor::new("", "1.0", "a:1").validate().is_err());
        assert!(ServiceDescriptor::new("orders", "1.0", " ").validate().is_err());
        assert!(ServiceDescriptor::new("orders", "", "a:1").validate().is_err());
        assert!(ServiceDescriptor::new("orders", "1.0", "a:1")
            .with_id("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_instance_defaults() {
        let now = SystemTime::now();
        let instance = ServiceInstance::from_descriptor(
            ServiceDescriptor::new("orders", "1.0-canary", "a:1").with_weight(3),
            "orders-1".to_string(),
            now,
        );
        assert!(instance.is_healthy);
        assert!(instance.is_canary());
        assert_eq!(instance.weight, 3);
        assert_eq!(instance.registered_at, now);
        assert_eq!(instance.last_health_check, now);
        assert_eq!(instance.metrics, InstanceMetrics::default());
    }

    #[test]
    fn test_metrics_running_mean() {
        let mut metrics = InstanceMetrics::default();
        metrics.record(true, 10.0);
        metrics.record(false, 30.0);
        metrics.record(true, 20.0);
        assert_eq!(metrics.requests, 3);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.failures, 1);
        assert!((metrics.average_response_time_ms - 20.0).abs() < 1e-9);
    }
}
