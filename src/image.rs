//! Container image build and registry push
//!
//! Images are built from the extracted artifact directory and pushed under a
//! per-build tag `<tag>-<unix timestamp>`, so repeated builds of the same tag
//! never overwrite each other in the registry.
//!
//! The real implementations shell out to the `docker` and `aws` CLIs; the
//! traits keep the pipeline testable without either.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::Error;

/// A uniquely tagged image in a repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry repository, e.g. `123.dkr.ecr.us-west-2.amazonaws.com/bots`
    pub repository: String,
    /// `<tag>-<unix timestamp>`
    pub time_tag: String,
}

impl ImageReference {
    /// Reference for a build of `tag` at the given unix timestamp
    pub fn for_build(repository: impl Into<String>, tag: &str, unix_timestamp: i64) -> Self {
        Self {
            repository: repository.into(),
            time_tag: format!("{}-{}", tag, unix_timestamp),
        }
    }

    /// Reference for a build of `tag` starting now
    pub fn now(repository: impl Into<String>, tag: &str) -> Self {
        Self::for_build(repository, tag, chrono::Utc::now().timestamp())
    }

    /// `repository:time_tag`
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.time_tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.time_tag)
    }
}

/// Registry credentials for a single push
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryToken {
    /// Login user
    pub username: String,
    /// Bearer token used as the password
    pub token: String,
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryToken")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Builds and pushes images
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `image` from the given context directory
    async fn build(&self, context: &Path, image: &ImageReference) -> Result<(), Error>;

    /// Push a previously built image
    async fn push(&self, image: &ImageReference, credentials: &RegistryToken) -> Result<(), Error>;
}

/// Obtains registry push credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryAuth: Send + Sync {
    /// Fetch a fresh token for `repository`
    async fn token(&self, repository: &str) -> Result<RegistryToken, Error>;
}

// =============================================================================
// Docker CLI
// =============================================================================

/// Image builder backed by the docker CLI against a configured daemon
#[derive(Clone, Debug)]
pub struct DockerCli {
    docker_host: String,
    dockerfile: String,
}

impl DockerCli {
    /// Create a builder talking to `docker_host` using `dockerfile` from the context
    pub fn new(docker_host: impl Into<String>, dockerfile: impl Into<String>) -> Self {
        Self {
            docker_host: docker_host.into(),
            dockerfile: dockerfile.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, Error> {
        let mut child = Command::new("docker")
            .args(args)
            .env("DOCKER_HOST", &self.docker_host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::image(format!("failed to run docker {}: {}", args[0], e)))?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Some(input) = stdin {
                pipe.write_all(input.as_bytes()).await?;
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::image(format!(
                "docker {} failed: {}",
                args[0],
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(&self, context: &Path, image: &ImageReference) -> Result<(), Error> {
        let dockerfile = context.join(&self.dockerfile);
        if !dockerfile.exists() {
            return Err(Error::precondition(format!(
                "dockerfile {} not found in artifact",
                dockerfile.display()
            )));
        }

        let full_name = image.full_name();
        let context = context.to_string_lossy();
        let dockerfile = dockerfile.to_string_lossy();
        info!(image = %full_name, "building image");
        let output = self
            .run(
                &["build", "-f", &dockerfile, "-t", &full_name, &context],
                None,
            )
            .await?;
        debug!(image = %full_name, output = %output.trim_end(), "image built");
        Ok(())
    }

    async fn push(&self, image: &ImageReference, credentials: &RegistryToken) -> Result<(), Error> {
        let registry = registry_host(&image.repository);
        self.run(
            &[
                "login",
                "--username",
                &credentials.username,
                "--password-stdin",
                registry,
            ],
            Some(&credentials.token),
        )
        .await?;

        let full_name = image.full_name();
        self.run(&["push", &full_name], None).await?;
        info!(image = %full_name, "image pushed");
        Ok(())
    }
}

/// Registry host part of a repository (`host/path` → `host`)
pub fn registry_host(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

// =============================================================================
// ECR authorization
// =============================================================================

/// Registry auth using `aws ecr get-authorization-token`
#[derive(Clone, Debug)]
pub struct EcrAuth {
    region: String,
}

impl EcrAuth {
    /// Create an authenticator for the given region
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

#[async_trait]
impl RegistryAuth for EcrAuth {
    async fn token(&self, repository: &str) -> Result<RegistryToken, Error> {
        // Registry id is the account number leading the registry host
        let registry_id = registry_host(repository)
            .split('.')
            .next()
            .unwrap_or_default();

        let output = Command::new("aws")
            .args([
                "ecr",
                "get-authorization-token",
                "--region",
                &self.region,
                "--registry-ids",
                registry_id,
                "--query",
                "authorizationData[0].authorizationToken",
                "--output",
                "text",
            ])
            .output()
            .await
            .map_err(|e| Error::image(format!("failed to run aws ecr: {}", e)))?;

        if !output.status.success() {
            return Err(Error::image(format!(
                "aws ecr get-authorization-token failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        decode_authorization_token(String::from_utf8_lossy(&output.stdout).trim())
    }
}

/// Decode an ECR authorization token (`base64("user:password")`)
pub fn decode_authorization_token(encoded: &str) -> Result<RegistryToken, Error> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| Error::image(format!("authorization token is not base64: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::image(format!("authorization token is not utf-8: {}", e)))?;
    let (username, token) = decoded
        .split_once(':')
        .ok_or_else(|| Error::image("authorization token has no user part"))?;
    Ok(RegistryToken {
        username: username.to_string(),
        token: token.to_string(),
    })
}
