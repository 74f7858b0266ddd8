//! Runtime configuration
//!
//! All settings are parsed once at startup from flags or environment variables
//! into [`ServeArgs`], then frozen into a [`PipelineConfig`] that is shared by
//! `Arc`. Nothing else in the crate reads the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use tracing::warn;

use crate::kube_utils::ClientMode;
use crate::poller::PollPolicy;
use crate::reconcile::ReadFailurePolicy;
use crate::sizing::{MemoryPolicy, DEFAULT_BASE_MIB, DEFAULT_COEFFICIENT, DEFAULT_SAFETY_FACTOR};
use crate::Error;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable, for local runs
    Pretty,
}

/// Cluster connection settings shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct ClusterArgs {
    /// Kubeconfig used for out-of-cluster access
    #[arg(long, env = "KUBER_CONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace all resources live in
    #[arg(long, env = "NAMESPACE", default_value = "nlu")]
    pub namespace: String,

    /// Secret whose keys become container environment variables
    #[arg(long, env = "SECRET_NAME")]
    pub secret_name: Option<String>,

    /// How to treat resource reads that fail for reasons other than 404
    #[arg(
        long,
        env = "READ_FAILURE_POLICY",
        value_enum,
        default_value_t = ReadFailurePolicy::Abort
    )]
    pub read_failure_policy: ReadFailurePolicy,
}

impl ClusterArgs {
    /// Connection used by the secret manager, which never uses in-cluster identity
    pub fn out_of_cluster(&self) -> Result<ClientMode, Error> {
        self.kubeconfig
            .clone()
            .map(ClientMode::Kubeconfig)
            .ok_or_else(|| Error::config("KUBER_CONFIG is required for secret management"))
    }

    /// Connection for the serve-mode `/variables` endpoint.
    ///
    /// `None` when no Secret is configured, or when one is but there is no
    /// kubeconfig to reach it with; the endpoint then answers 500 while builds
    /// keep running.
    pub fn variables_connection(&self) -> Option<ClientMode> {
        let name = self.secret_name.as_deref()?;
        match self.out_of_cluster() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!(secret = name, error = %e, "variables endpoint disabled");
                None
            }
        }
    }
}

/// Settings for the `serve` subcommand
#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Address the HTTP server binds to
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: SocketAddr,

    /// Scratch directory for downloaded artifacts
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/kubeship")]
    pub work_dir: PathBuf,

    /// Image repository images are pushed to
    #[arg(long, env = "DOCKER_REPO")]
    pub docker_repo: String,

    /// Docker daemon used for builds
    #[arg(long, env = "DOCKER_HOST", default_value = "tcp://127.0.0.1:2375")]
    pub docker_host: String,

    /// Dockerfile name inside the artifact
    #[arg(long, env = "DOCKERFILE", default_value = "Dockerfile.nlu")]
    pub dockerfile: String,

    /// Region for object storage and the registry
    #[arg(long, env = "AWS_REGION", default_value = "us-west-2")]
    pub region: String,

    /// Use the pod's service account instead of the kubeconfig for deploys
    #[arg(long, env = "INCLUSTER", default_value_t = false)]
    pub in_cluster: bool,

    /// Base domain for ingress hosts
    #[arg(long, env = "DOMAIN")]
    pub domain: String,

    /// Concurrent builds
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Training files summed for memory sizing
    #[arg(
        long,
        env = "TRAINING_FILES",
        value_delimiter = ',',
        default_value = "intent_train.csv,entity.csv"
    )]
    pub training_files: Vec<String>,

    /// Memory per training byte, in MiB
    #[arg(long, env = "MEMORY_COEFFICIENT", default_value_t = DEFAULT_COEFFICIENT)]
    pub memory_coefficient: f64,

    /// Baseline memory in MiB
    #[arg(long, env = "MEMORY_BASE_MIB", default_value_t = DEFAULT_BASE_MIB)]
    pub memory_base_mib: f64,

    /// Multiplier applied to the raw estimate
    #[arg(long, env = "MEMORY_SAFETY_FACTOR", default_value_t = DEFAULT_SAFETY_FACTOR)]
    pub memory_safety_factor: f64,

    /// Readiness checks before giving up
    #[arg(long, env = "POLL_ATTEMPTS", default_value_t = 60)]
    pub poll_attempts: u32,

    /// Seconds between readiness checks
    #[arg(long, env = "POLL_DELAY_SECS", default_value_t = 10)]
    pub poll_delay_secs: u64,

    /// Available replicas that count as ready
    #[arg(long, env = "POLL_MIN_AVAILABLE", default_value_t = 2)]
    pub poll_min_available: i32,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Cluster connection
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Immutable configuration for the deploy pipeline
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Scratch root; each tag builds in `work_dir/<tag>`
    pub work_dir: PathBuf,
    /// Image repository
    pub docker_repo: String,
    /// Docker daemon address
    pub docker_host: String,
    /// Dockerfile name inside the artifact
    pub dockerfile: String,
    /// Object storage and registry region
    pub region: String,
    /// Ingress base domain
    pub domain: String,
    /// Namespace for every resource
    pub namespace: String,
    /// Shared environment Secret, if any
    pub secret_name: Option<String>,
    /// Files summed for memory sizing
    pub training_files: Vec<String>,
    /// Memory sizing constants
    pub memory: MemoryPolicy,
    /// Readiness polling budget
    pub poll: PollPolicy,
    /// Read-failure handling during reconcile
    pub read_failure_policy: ReadFailurePolicy,
    /// How the pipeline connects to the cluster
    pub client_mode: ClientMode,
    /// Worker pool depth
    pub workers: usize,
}

impl TryFrom<&ServeArgs> for PipelineConfig {
    type Error = Error;

    fn try_from(args: &ServeArgs) -> Result<Self, Error> {
        if args.workers == 0 {
            return Err(Error::config("WORKERS must be at least 1"));
        }
        if args.poll_attempts == 0 {
            return Err(Error::config("POLL_ATTEMPTS must be at least 1"));
        }
        if args.domain.is_empty() {
            return Err(Error::config("DOMAIN must not be empty"));
        }
        if args.docker_repo.is_empty() {
            return Err(Error::config("DOCKER_REPO must not be empty"));
        }
        if !args.memory_coefficient.is_finite() || args.memory_coefficient < 0.0 {
            return Err(Error::config(
                "MEMORY_COEFFICIENT must be a finite number, zero or greater",
            ));
        }
        if !args.memory_base_mib.is_finite() || args.memory_base_mib <= 0.0 {
            return Err(Error::config(
                "MEMORY_BASE_MIB must be a finite number greater than zero",
            ));
        }
        if !args.memory_safety_factor.is_finite() || args.memory_safety_factor <= 0.0 {
            return Err(Error::config(
                "MEMORY_SAFETY_FACTOR must be a finite number greater than zero",
            ));
        }

        let client_mode = if args.in_cluster {
            ClientMode::InCluster
        } else {
            args.cluster.out_of_cluster()?
        };

        Ok(Self {
            work_dir: args.work_dir.clone(),
            docker_repo: args.docker_repo.clone(),
            docker_host: args.docker_host.clone(),
            dockerfile: args.dockerfile.clone(),
            region: args.region.clone(),
            domain: args.domain.clone(),
            namespace: args.cluster.namespace.clone(),
            secret_name: args.cluster.secret_name.clone(),
            training_files: args.training_files.clone(),
            memory: MemoryPolicy {
                coefficient: args.memory_coefficient,
                base_mib: args.memory_base_mib,
                safety_factor: args.memory_safety_factor,
            },
            poll: PollPolicy {
                attempts: args.poll_attempts,
                delay: Duration::from_secs(args.poll_delay_secs),
                min_available: args.poll_min_available,
            },
            read_failure_policy: args.cluster.read_failure_policy,
            client_mode,
            workers: args.workers,
        })
    }
}
