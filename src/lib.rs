//! Kubeship - builds packaged service artifacts and reconciles them onto Kubernetes
//!
//! A build request names an artifact in object storage. Kubeship downloads and
//! extracts it, sizes a memory reservation from its training data, builds and
//! pushes a container image, then creates or replaces the cluster resources that
//! make the artifact reachable at `<tag>.<domain>`.
//!
//! # Modules
//!
//! - [`sizing`] - Memory reservation from training-data volume
//! - [`resources`] - Declarative Service, Deployment, autoscaler, Ingress and Secret specs
//! - [`reconcile`] - Create-or-replace of each resource kind
//! - [`poller`] - Bounded readiness polling with a dual convergence signal
//! - [`secrets`] - Additive upsert of the shared environment secret
//! - [`pipeline`] - The download → build → push → reconcile → poll state machine
//! - [`worker`] - Fixed-depth worker pool and result callbacks
//! - [`server`] - HTTP front door
//! - [`artifact`] / [`image`] - Object storage, archive and container collaborators
//! - [`config`] - Startup configuration
//! - [`kube_utils`] / [`telemetry`] - Cluster client and tracing setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod artifact;
pub mod config;
pub mod error;
pub mod image;
pub mod kube_utils;
pub mod pipeline;
pub mod poller;
pub mod reconcile;
pub mod resources;
pub mod secrets;
pub mod server;
pub mod sizing;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Fixed Resource Policy
// =============================================================================
// Every deployed artifact gets the same shape. These values are contract with
// the artifact itself (port, health path) or deliberate sizing policy.

/// Port the deployed container listens on
pub const CONTAINER_PORT: i32 = 5000;

/// Liveness path the deployed container must serve on [`CONTAINER_PORT`]
pub const HEALTH_PATH: &str = "/healthcheck";

/// Port exposed by the ClusterIP Service and targeted by the Ingress
pub const SERVICE_PORT: i32 = 80;

/// CPU request for every deployed container (not derived from sizing)
pub const CPU_REQUEST: &str = "80m";

/// Replicas set on a freshly created Deployment
pub const INITIAL_REPLICAS: i32 = 1;

/// Autoscaler lower bound
pub const AUTOSCALER_MIN_REPLICAS: i32 = 2;

/// Autoscaler upper bound
pub const AUTOSCALER_MAX_REPLICAS: i32 = 5;

/// Autoscaler target CPU utilization percentage
pub const AUTOSCALER_TARGET_CPU: i32 = 100;

/// Label key shared by the Deployment pod template and the Service selector
pub const APP_LABEL: &str = "app";

/// Env var injected when no secret is configured, so the container can tell
pub const NO_SECRETS_ENV: &str = "no-nlu-variables";

/// Field manager name used on patches
pub const FIELD_MANAGER: &str = "kubeship";
