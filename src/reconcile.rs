//! Create-or-replace reconciliation per resource kind
//!
//! Each kind is reconciled independently: read by name, then create if absent
//! or overwrite if present. There is no field diffing and no rollback; a failed
//! step leaves earlier steps in place.
//!
//! Reads distinguish three outcomes through [`Lookup`]. Only a 404 counts as
//! absent. Any other read failure is handled per [`ReadFailurePolicy`].

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use crate::{Error, FIELD_MANAGER};

/// Result of reading a resource by name
#[derive(Debug)]
pub enum Lookup<K> {
    /// The resource exists
    Found(K),
    /// The API answered 404
    NotFound,
    /// The read failed for another reason (transport, auth, server error)
    Unavailable(Error),
}

/// How to treat a read that is neither found nor not-found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReadFailurePolicy {
    /// Fail the step; nothing is written
    #[default]
    Abort,
    /// Treat the resource as absent and attempt a create
    AssumeAbsent,
}

/// How an existing resource is overwritten
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Full replace (PUT)
    Replace,
    /// Strategic merge patch
    Patch,
}

/// What reconciliation did to a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The resource did not exist and was created
    Created,
    /// The resource existed and was replaced
    Replaced,
    /// The resource existed and was patched
    Patched,
}

/// Outcome of reconciling one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Resource kind
    pub kind: String,
    /// Resource name
    pub name: String,
    /// What happened
    pub action: ReconcileAction,
    /// Resource version returned by the API
    pub resource_version: Option<String>,
}

/// Typed CRUD for one namespaced resource kind
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Read a resource by name
    async fn get(&self, name: &str) -> Lookup<K>;

    /// Create a resource
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replace an existing resource
    async fn replace(&self, name: &str, obj: &K) -> Result<K, Error>;

    /// Strategic-merge-patch an existing resource
    async fn patch(&self, name: &str, obj: &K) -> Result<K, Error>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Store for `K` in `namespace`
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Lookup<K> {
        match self.api.get(name).await {
            Ok(obj) => Lookup::Found(obj),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Lookup::NotFound,
            Err(e) => Lookup::Unavailable(e.into()),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, Error> {
        Ok(self.api.replace(name, &PostParams::default(), obj).await?)
    }

    async fn patch(&self, name: &str, obj: &K) -> Result<K, Error> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api.patch(name, &params, &Patch::Strategic(obj)).await?)
    }
}

/// Read-only view of a Deployment's available replica count
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplicaStatus: Send + Sync {
    /// Available replicas of the named Deployment; `None` when the field is unset
    async fn available_replicas(&self, name: &str) -> Result<Option<i32>, Error>;
}

#[async_trait]
impl ReplicaStatus for KubeStore<Deployment> {
    async fn available_replicas(&self, name: &str) -> Result<Option<i32>, Error> {
        let deployment = self.api.get_status(name).await?;
        Ok(deployment.status.and_then(|s| s.available_replicas))
    }
}

/// Collapse a [`Lookup`] into presence, applying the read-failure policy
pub fn resolve<K>(
    lookup: Lookup<K>,
    kind: &str,
    name: &str,
    policy: ReadFailurePolicy,
) -> Result<Option<K>, Error> {
    match lookup {
        Lookup::Found(obj) => Ok(Some(obj)),
        Lookup::NotFound => {
            debug!(kind, name, "resource does not exist");
            Ok(None)
        }
        Lookup::Unavailable(e) => match policy {
            ReadFailurePolicy::Abort => Err(Error::cluster(kind, name, e.to_string())),
            ReadFailurePolicy::AssumeAbsent => {
                warn!(kind, name, error = %e, "read failed, treating resource as absent");
                Ok(None)
            }
        },
    }
}

/// Bring `desired` into existence, creating or overwriting by name
#[instrument(skip_all, fields(kind = %K::kind(&()), name = ?desired.meta().name))]
pub async fn reconcile<K>(
    store: &dyn ResourceStore<K>,
    desired: &K,
    strategy: UpdateStrategy,
    policy: ReadFailurePolicy,
) -> Result<ReconcileOutcome, Error>
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    let kind = K::kind(&()).to_string();
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::precondition(format!("{} has no name", kind)))?;

    let existing = resolve(store.get(&name).await, &kind, &name, policy)?;

    let (applied, action) = match (existing, strategy) {
        (None, _) => (store.create(desired).await?, ReconcileAction::Created),
        (Some(_), UpdateStrategy::Replace) => {
            (store.replace(&name, desired).await?, ReconcileAction::Replaced)
        }
        (Some(_), UpdateStrategy::Patch) => {
            (store.patch(&name, desired).await?, ReconcileAction::Patched)
        }
    };

    let resource_version = applied.meta().resource_version.clone();
    info!(
        kind = %kind,
        name = %name,
        action = ?action,
        resource_version = ?resource_version,
        "resource reconciled"
    );

    Ok(ReconcileOutcome {
        kind,
        name,
        action,
        resource_version,
    })
}
