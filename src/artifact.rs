//! Artifact download and extraction
//!
//! Artifacts are zip archives in object storage. Each build gets its own scratch
//! directory `<work_dir>/<tag>`, wiped before every download so stale files from
//! an earlier build of the same tag never leak into the image.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::Error;

/// Archive file name inside the scratch directory
const ARCHIVE_NAME: &str = "artifact.zip";

/// Fetches an artifact and unpacks it into a local directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `source` and extract it; returns the extracted directory
    async fn fetch(&self, source: &str, tag: &str) -> Result<PathBuf, Error>;
}

/// Derive the deployment tag from an artifact host path.
///
/// Segments are joined with `-` and lowercased. An empty result is rejected,
/// since the tag becomes a resource name and a DNS label.
pub fn tag_from_host_path(host_path: &[String]) -> Result<String, Error> {
    let tag = host_path.join("-").to_lowercase();
    if tag.is_empty() {
        return Err(Error::precondition("host_path is empty"));
    }
    Ok(tag)
}

/// Split an object URL into bucket and key.
///
/// Accepts `s3://bucket/key` and `https://host/bucket/key`; the bucket is the
/// first path segment after the host.
pub fn parse_object_location(source: &str) -> Result<(String, String), Error> {
    let rest = source
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::artifact(format!("not a URL: {}", source)))?;

    let path = if source.starts_with("s3://") {
        rest
    } else {
        rest.split_once('/').map(|(_, path)| path).unwrap_or_default()
    };

    match path.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(Error::artifact(format!(
            "no bucket and key in location: {}",
            source
        ))),
    }
}

/// [`ArtifactFetcher`] using the `aws` CLI and `unzip`
#[derive(Clone, Debug)]
pub struct S3ArtifactFetcher {
    work_dir: PathBuf,
    region: String,
    dockerfile: String,
}

impl S3ArtifactFetcher {
    /// Create a fetcher writing under `work_dir`
    pub fn new(
        work_dir: impl Into<PathBuf>,
        region: impl Into<String>,
        dockerfile: impl Into<String>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            region: region.into(),
            dockerfile: dockerfile.into(),
        }
    }

    /// Scratch directory for a tag
    pub fn scratch_dir(&self, tag: &str) -> PathBuf {
        self.work_dir.join(tag)
    }
}

/// Remove and recreate `dir`
pub async fn prepare_scratch_dir(dir: &Path) -> Result<(), Error> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "cleared previous workspace"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

async fn run(program: &str, args: &[&str]) -> Result<(), Error> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::artifact(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::artifact(format!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[async_trait]
impl ArtifactFetcher for S3ArtifactFetcher {
    async fn fetch(&self, source: &str, tag: &str) -> Result<PathBuf, Error> {
        let (bucket, key) = parse_object_location(source)?;
        let dir = self.scratch_dir(tag);
        prepare_scratch_dir(&dir).await?;

        let archive = dir.join(ARCHIVE_NAME);
        let archive_str = archive.to_string_lossy();
        let dir_str = dir.to_string_lossy();
        let object = format!("s3://{}/{}", bucket, key);

        info!(tag, bucket = %bucket, key = %key, "downloading artifact");
        run(
            "aws",
            &["s3", "cp", &object, &archive_str, "--region", &self.region],
        )
        .await?;

        run("unzip", &["-o", "-q", &archive_str, "-d", &dir_str]).await?;
        tokio::fs::remove_file(&archive).await?;

        if !dir.join(&self.dockerfile).exists() {
            warn!(tag, dockerfile = %self.dockerfile, "artifact has no dockerfile");
        }
        info!(tag, dir = %dir.display(), "artifact extracted");
        Ok(dir)
    }
}
