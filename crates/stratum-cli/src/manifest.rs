use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use stratum_common::error::{Result, StratumError};
use stratum_common::ServiceDescriptor;
use stratum_orchestrator::OrchestratorConfig;

/// Service instances to register at startup.
///
/// ```json
/// {
///   "services": [
///     { "name": "payments", "version": "1.4.0", "address": "10.0.0.7:8080",
///       "health_endpoint": "http://10.0.0.7:8081/health", "weight": 2 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

impl Manifest {
    /// Reads and validates a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Rejects malformed entries and explicit ids used twice for one service.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, descriptor) in self.services.iter().enumerate() {
            descriptor
                .validate()
                .map_err(|e| StratumError::Registration(format!("services[{}]: {}", index, e)))?;
            if let Some(id) = &descriptor.id {
                if !seen.insert((descriptor.name.as_str(), id.as_str())) {
                    return Err(StratumError::Registration(format!(
                        "services[{}]: duplicate id {} for service {}",
                        index, id, descriptor.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Distinct service names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Reads an orchestrator configuration file; missing keys take their defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: OrchestratorConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
