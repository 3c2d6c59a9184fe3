//! controller-samples - Kubernetes controller manager scaffold
//!
//! A manager owns a set of runnables, starts them together and stops them on
//! a single shutdown signal. Runnables that need leader election are deferred
//! until this replica holds the leader Lease.
//!
//! # Modules
//!
//! - [`manager`] - Runnable registration, start/stop orchestration
//! - [`runnable`] - Runnable contract and the interval heartbeat logger
//! - [`leader_election`] - Lease-based leader election
//! - [`controller`] - Reconciler for the `Test` custom resource
//! - [`crd`] - Custom Resource Definitions
//! - [`probes`] - Metrics and health probe HTTP server
//! - [`metrics`] - Prometheus collectors
//! - [`telemetry`] - Logging initialization
//! - [`signals`] - OS signal handling
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod manager;
pub mod metrics;
pub mod probes;
pub mod runnable;
pub mod signals;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name of the Lease used for leader election
pub const LEADER_ELECTION_ID: &str = "e8a34fb3.my.domain";

/// Default bind address for metrics and health probes
pub const DEFAULT_METRICS_ADDR: &str = ":8080";

/// Environment variable holding the pod name (downward API)
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Environment variable holding the pod namespace (downward API)
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
