//! Kubernetes client construction

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Which identity a client authenticates with
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMode {
    /// The pod's mounted service account
    InCluster,
    /// An explicit kubeconfig file
    Kubeconfig(PathBuf),
}

/// Create a kube client with default timeouts
pub async fn create_client(mode: &ClientMode) -> Result<Client, Error> {
    create_client_with_timeout(mode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    mode: &ClientMode,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match mode {
        ClientMode::InCluster => Config::incluster()
            .map_err(|e| Error::config(format!("failed to load in-cluster config: {}", e)))?,
        ClientMode::Kubeconfig(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    debug!(cluster_url = %config.cluster_url, mode = ?mode, "creating kube client");

    Client::try_from(config).map_err(|e| Error::config(format!("failed to create client: {}", e)))
}
