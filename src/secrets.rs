//! Shared environment secret management
//!
//! Deployed artifacts read their environment from one Secret. Operators seed or
//! rotate values through [`SecretManager::upsert`], which only ever adds or
//! overwrites keys; keys not named in an upsert survive it.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::{info, instrument};

use crate::reconcile::{resolve, ReadFailurePolicy, ResourceStore};
use crate::resources::{build_secret, encode_values, SecretRef};
use crate::Error;

/// Whether an upsert created the Secret or merged into it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The Secret did not exist
    Created,
    /// New values were merged into the existing Secret
    Merged,
}

/// Overlay `values` onto `existing`; overlay wins on key collisions
pub fn merge_secret_data(
    existing: BTreeMap<String, ByteString>,
    values: BTreeMap<String, ByteString>,
) -> BTreeMap<String, ByteString> {
    let mut merged = existing;
    merged.extend(values);
    merged
}

/// Reads and upserts the shared environment Secret
pub struct SecretManager {
    store: Arc<dyn ResourceStore<Secret>>,
    name: String,
    namespace: String,
    policy: ReadFailurePolicy,
}

impl SecretManager {
    /// Manage the Secret `name` in `namespace` through `store`
    pub fn new(
        store: Arc<dyn ResourceStore<Secret>>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        policy: ReadFailurePolicy,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            namespace: namespace.into(),
            policy,
        }
    }

    /// Name of the managed Secret
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference to the Secret's current keys, if it exists
    pub async fn lookup(&self) -> Result<Option<SecretRef>, Error> {
        let lookup = self.store.get(&self.name).await;
        let existing = resolve(lookup, "Secret", &self.name, self.policy)?;
        Ok(existing.map(|secret| SecretRef::from_secret(&self.name, &secret)))
    }

    /// Add or overwrite the given plaintext values
    #[instrument(skip_all, fields(secret = %self.name, keys = values.len()))]
    pub async fn upsert(
        &self,
        values: &BTreeMap<String, String>,
    ) -> Result<UpsertOutcome, Error> {
        let lookup = self.store.get(&self.name).await;
        let existing = resolve(lookup, "Secret", &self.name, self.policy)?;

        match existing {
            None => {
                let secret = build_secret(&self.name, &self.namespace, values);
                self.store.create(&secret).await?;
                info!(secret = %self.name, "secret created");
                Ok(UpsertOutcome::Created)
            }
            Some(mut secret) => {
                let current = secret.data.take().unwrap_or_default();
                secret.data = Some(merge_secret_data(current, encode_values(values)));
                self.store.replace(&self.name, &secret).await?;
                info!(secret = %self.name, "secret updated");
                Ok(UpsertOutcome::Merged)
            }
        }
    }
}
