//! Kubeship - build artifacts into images and deploy them to Kubernetes

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::Secret;
use tracing::info;

use kubeship::artifact::S3ArtifactFetcher;
use kubeship::config::{ClusterArgs, LogFormat, PipelineConfig, ServeArgs};
use kubeship::image::{DockerCli, EcrAuth};
use kubeship::kube_utils::{create_client, ClientMode};
use kubeship::pipeline::{ClusterApis, Collaborators, Pipeline};
use kubeship::poller::SystemResolver;
use kubeship::reconcile::KubeStore;
use kubeship::secrets::SecretManager;
use kubeship::server::{self, plaintext_values, AppState};
use kubeship::telemetry::init_tracing;
use kubeship::worker::{HttpCallback, WorkerPool};

/// Kubeship - artifact build and deploy service
#[derive(Parser, Debug)]
#[command(name = "kubeship", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP service and build workers
    Serve(ServeArgs),

    /// Upsert environment variables into the shared Secret and exit
    ///
    /// Always connects with the kubeconfig, never the in-cluster identity.
    Seed(SeedArgs),
}

/// Seed mode arguments
#[derive(Args, Debug)]
struct SeedArgs {
    /// JSON object of variable names to values
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(flatten)]
    cluster: ClusterArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Seed(args) => run_seed(args).await,
    }
}

async fn secret_manager(
    cluster: &ClusterArgs,
    name: &str,
    mode: &ClientMode,
) -> anyhow::Result<SecretManager> {
    let client = create_client(mode)
        .await
        .context("failed to connect for secret management")?;
    let store = Arc::new(KubeStore::<Secret>::namespaced(client, &cluster.namespace));
    Ok(SecretManager::new(
        store,
        name,
        &cluster.namespace,
        cluster.read_failure_policy,
    ))
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);
    let config = Arc::new(PipelineConfig::try_from(&args)?);

    let client = create_client(&config.client_mode)
        .await
        .context("failed to connect to cluster")?;
    let collaborators = Collaborators {
        fetcher: Arc::new(S3ArtifactFetcher::new(
            &config.work_dir,
            &config.region,
            &config.dockerfile,
        )),
        builder: Arc::new(DockerCli::new(&config.docker_host, &config.dockerfile)),
        registry_auth: Arc::new(EcrAuth::new(&config.region)),
        resolver: Arc::new(SystemResolver),
    };
    let cluster = ClusterApis::from_client(client, &config.namespace);
    let pipeline = Pipeline::new(config.clone(), collaborators, cluster);

    let jobs = WorkerPool::spawn(
        config.workers,
        Arc::new(pipeline),
        Arc::new(HttpCallback::new()?),
    );
    let secrets = match (&args.cluster.secret_name, args.cluster.variables_connection()) {
        (Some(name), Some(mode)) => {
            Some(Arc::new(secret_manager(&args.cluster, name, &mode).await?))
        }
        _ => None,
    };

    info!(
        workers = config.workers,
        namespace = %config.namespace,
        domain = %config.domain,
        "kubeship starting"
    );
    let state = AppState {
        jobs: Arc::new(jobs),
        secrets,
    };
    server::serve(args.listen_addr, state).await?;
    Ok(())
}

async fn run_seed(args: SeedArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let values: BTreeMap<String, String> = plaintext_values(
        serde_json::from_slice(&raw).context("variables file must be a JSON object")?,
    );

    let name = args
        .cluster
        .secret_name
        .as_deref()
        .context("SECRET_NAME is required for seeding")?;
    let manager = secret_manager(&args.cluster, name, &args.cluster.out_of_cluster()?).await?;
    let outcome = manager.upsert(&values).await?;
    info!(secret = %manager.name(), keys = values.len(), outcome = ?outcome, "variables seeded");
    Ok(())
}
