//! Build-and-deploy pipeline
//!
//! One run walks a fixed sequence of stages:
//!
//! ```text
//! Downloading → Sizing → Building → Pushing → Reconciling → Polling → Done
//! ```
//!
//! Stages never repeat and are never retried. The first failing stage ends the
//! run with a [`PipelineFailure`] naming it; whatever earlier stages changed in
//! the registry or the cluster stays as it is.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use serde::Serialize;
use tracing::{info, instrument};

use crate::artifact::ArtifactFetcher;
use crate::config::PipelineConfig;
use crate::image::{ImageBuilder, ImageReference, RegistryAuth};
use crate::poller::{AvailabilityPoller, HostResolver};
use crate::reconcile::{
    reconcile, KubeStore, ReconcileOutcome, ReplicaStatus, ResourceStore, UpdateStrategy,
};
use crate::resources::{ResourceCompiler, SecretRef};
use crate::secrets::SecretManager;
use crate::sizing::{training_data_size, MemoryEstimate};
use crate::Error;

/// Pipeline states, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    /// Fetching and extracting the artifact
    Downloading,
    /// Measuring training data and estimating memory
    Sizing,
    /// Building the image
    Building,
    /// Pushing the image to the registry
    Pushing,
    /// Applying cluster resources
    Reconciling,
    /// Waiting for the deployment to become reachable
    Polling,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Downloading => "downloading",
            Self::Sizing => "sizing",
            Self::Building => "building",
            Self::Pushing => "pushing",
            Self::Reconciling => "reconciling",
            Self::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// A single deploy request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    /// Object storage URL of the artifact archive
    pub source_location: String,
    /// Slug naming every resource, the image tag prefix and the DNS label
    pub tag: String,
}

/// Terminal result of a run that got through every stage
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    /// Whether the deployment became reachable in time
    pub success: bool,
    /// The deployment's FQDN
    pub response: String,
}

/// A stage that failed, with the error that stopped it
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    /// The failing stage
    pub stage: PipelineStage,
    /// What went wrong
    #[source]
    pub error: Error,
}

fn failed_at(stage: PipelineStage) -> impl FnOnce(Error) -> PipelineFailure {
    move |error| PipelineFailure { stage, error }
}

/// Cluster access for every resource kind the pipeline touches
#[derive(Clone)]
pub struct ClusterApis {
    /// Services
    pub services: Arc<dyn ResourceStore<Service>>,
    /// Deployments
    pub deployments: Arc<dyn ResourceStore<Deployment>>,
    /// Horizontal pod autoscalers
    pub autoscalers: Arc<dyn ResourceStore<HorizontalPodAutoscaler>>,
    /// Ingresses
    pub ingresses: Arc<dyn ResourceStore<Ingress>>,
    /// Secrets
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    /// Deployment status, for polling
    pub replicas: Arc<dyn ReplicaStatus>,
}

impl ClusterApis {
    /// Typed stores for every kind in `namespace`
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            services: Arc::new(KubeStore::<Service>::namespaced(client.clone(), namespace)),
            deployments: Arc::new(KubeStore::<Deployment>::namespaced(client.clone(), namespace)),
            autoscalers: Arc::new(KubeStore::<HorizontalPodAutoscaler>::namespaced(
                client.clone(),
                namespace,
            )),
            ingresses: Arc::new(KubeStore::<Ingress>::namespaced(client.clone(), namespace)),
            secrets: Arc::new(KubeStore::<Secret>::namespaced(client.clone(), namespace)),
            replicas: Arc::new(KubeStore::<Deployment>::namespaced(client, namespace)),
        }
    }
}

/// External collaborators the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    /// Artifact download and extraction
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Image build and push
    pub builder: Arc<dyn ImageBuilder>,
    /// Registry credentials
    pub registry_auth: Arc<dyn RegistryAuth>,
    /// DNS resolution for the readiness check
    pub resolver: Arc<dyn HostResolver>,
}

/// Runs build requests from download through readiness
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    cluster: ClusterApis,
    compiler: ResourceCompiler,
    poller: AvailabilityPoller,
    secrets: Option<SecretManager>,
}

impl Pipeline {
    /// Assemble a pipeline
    pub fn new(
        config: Arc<PipelineConfig>,
        collaborators: Collaborators,
        cluster: ClusterApis,
    ) -> Self {
        let compiler = ResourceCompiler::new(&config.namespace, &config.domain);
        let poller = AvailabilityPoller::new(
            cluster.replicas.clone(),
            collaborators.resolver.clone(),
            config.poll,
        );
        let secrets = config.secret_name.as_ref().map(|name| {
            SecretManager::new(
                cluster.secrets.clone(),
                name,
                &config.namespace,
                config.read_failure_policy,
            )
        });

        Self {
            config,
            collaborators,
            cluster,
            compiler,
            poller,
            secrets,
        }
    }

    /// FQDN a tag is served under
    pub fn fqdn(&self, tag: &str) -> String {
        self.compiler.fqdn(tag)
    }

    /// Run every stage for `request`.
    ///
    /// A readiness timeout is `Ok` with `success: false`; only stage failures are `Err`.
    #[instrument(skip(self, request), fields(tag = %request.tag))]
    pub async fn run(&self, request: &BuildRequest) -> Result<PipelineResult, PipelineFailure> {
        let tag = request.tag.as_str();
        let fqdn = self.compiler.fqdn(tag);

        let context = self
            .download(request)
            .await
            .map_err(failed_at(PipelineStage::Downloading))?;

        let memory = self
            .size(&context)
            .await
            .map_err(failed_at(PipelineStage::Sizing))?;

        let image = ImageReference::now(&self.config.docker_repo, tag);
        enter(PipelineStage::Building, tag);
        self.collaborators
            .builder
            .build(&context, &image)
            .await
            .map_err(failed_at(PipelineStage::Building))?;

        self.push(tag, &image)
            .await
            .map_err(failed_at(PipelineStage::Pushing))?;

        self.apply(tag, &image, &memory)
            .await
            .map_err(failed_at(PipelineStage::Reconciling))?;

        enter(PipelineStage::Polling, tag);
        let success = self.poller.await_ready(tag, &fqdn).await;
        info!(tag, fqdn = %fqdn, success, "pipeline finished");

        Ok(PipelineResult {
            success,
            response: fqdn,
        })
    }

    async fn download(&self, request: &BuildRequest) -> Result<PathBuf, Error> {
        enter(PipelineStage::Downloading, &request.tag);
        self.collaborators
            .fetcher
            .fetch(&request.source_location, &request.tag)
            .await
    }

    async fn size(&self, context: &std::path::Path) -> Result<MemoryEstimate, Error> {
        let bytes = training_data_size(context, &self.config.training_files).await?;
        let memory = self.config.memory.estimate(bytes);
        info!(
            stage = %PipelineStage::Sizing,
            training_bytes = bytes,
            memory = %memory.quantity(),
            "memory sized"
        );
        Ok(memory)
    }

    async fn push(&self, tag: &str, image: &ImageReference) -> Result<(), Error> {
        enter(PipelineStage::Pushing, tag);
        let token = self
            .collaborators
            .registry_auth
            .token(&image.repository)
            .await?;
        self.collaborators.builder.push(image, &token).await
    }

    /// Secret lookup first, then Service, Deployment, autoscaler, Ingress
    async fn apply(
        &self,
        tag: &str,
        image: &ImageReference,
        memory: &MemoryEstimate,
    ) -> Result<Vec<ReconcileOutcome>, Error> {
        enter(PipelineStage::Reconciling, tag);
        let policy = self.config.read_failure_policy;

        let secret: Option<SecretRef> = match &self.secrets {
            Some(manager) => manager.lookup().await?,
            None => None,
        };
        let resources = self.compiler.compile(tag, image, memory, secret.as_ref());

        Ok(vec![
            reconcile(
                self.cluster.services.as_ref(),
                &resources.service,
                UpdateStrategy::Patch,
                policy,
            )
            .await?,
            reconcile(
                self.cluster.deployments.as_ref(),
                &resources.deployment,
                UpdateStrategy::Replace,
                policy,
            )
            .await?,
            reconcile(
                self.cluster.autoscalers.as_ref(),
                &resources.autoscaler,
                UpdateStrategy::Replace,
                policy,
            )
            .await?,
            reconcile(
                self.cluster.ingresses.as_ref(),
                &resources.ingress,
                UpdateStrategy::Replace,
                policy,
            )
            .await?,
        ])
    }
}

fn enter(stage: PipelineStage, tag: &str) {
    info!(stage = %stage, tag, "entering stage");
}
