//! Stratum Common Types
//!
//! Shared vocabulary for the stratum service-orchestration core:
//!
//! - [`instance`] - service descriptors, registered instance snapshots and their counters
//! - [`circuit`] - circuit breaker states shared by breakers and metrics snapshots
//! - [`error`] - the error taxonomy surfaced by registry and call paths
//!
//! # Example
//!
//! ```
//! use stratum_common::{ServiceDescriptor, is_canary_version};
//!
//! let descriptor = ServiceDescriptor::new("orders", "2.0.0-canary", "10.0.0.7:8080")
//!     .with_health_endpoint("10.0.0.7:8081")
//!     .with_weight(2);
//! assert!(descriptor.validate().is_ok());
//! assert!(is_canary_version(&descriptor.version));
//! ```

pub mod circuit;
pub mod error;
pub mod instance;

pub use circuit::CircuitState;
pub use error::{DownstreamError, Result, StratumError};
pub use instance::{
    is_canary_version, InstanceMetrics, ServiceDescriptor, ServiceInstance, CANARY_MARKER,
};
