//! Deployment availability polling
//!
//! A deployment counts as reachable once either signal holds:
//! - the Deployment reports at least `min_available` available replicas
//! - the artifact's FQDN resolves in DNS
//!
//! Polling is a fixed number of attempts with a fixed sleep between them. Running
//! out of attempts is a normal outcome, returned as `false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use crate::reconcile::ReplicaStatus;

/// Default number of polling attempts
pub const DEFAULT_ATTEMPTS: u32 = 60;

/// Default delay between attempts
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Default available-replica threshold
pub const DEFAULT_MIN_AVAILABLE: i32 = 2;

/// Attempt budget and convergence threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total checks before giving up
    pub attempts: u32,
    /// Sleep between consecutive checks
    pub delay: Duration,
    /// Available replicas that count as converged
    pub min_available: i32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
            min_available: DEFAULT_MIN_AVAILABLE,
        }
    }
}

/// Resolves host names
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Whether `host` currently resolves to at least one address
    async fn resolves(&self, host: &str) -> bool;
}

/// [`HostResolver`] using the system resolver
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolves(&self, host: &str) -> bool {
        match tokio::net::lookup_host((host, 80)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(host, error = %e, "host does not resolve yet");
                false
            }
        }
    }
}

/// Waits for a deployed artifact to become reachable
pub struct AvailabilityPoller {
    replicas: Arc<dyn ReplicaStatus>,
    resolver: Arc<dyn HostResolver>,
    policy: PollPolicy,
}

impl AvailabilityPoller {
    /// Create a poller from its two signal sources
    pub fn new(
        replicas: Arc<dyn ReplicaStatus>,
        resolver: Arc<dyn HostResolver>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            replicas,
            resolver,
            policy,
        }
    }

    /// Poll until the deployment `tag` is available or `fqdn` resolves.
    ///
    /// Returns `true` on the first converged attempt and `false` once every
    /// attempt has been spent.
    #[instrument(skip(self), fields(attempts = self.policy.attempts))]
    pub async fn await_ready(&self, tag: &str, fqdn: &str) -> bool {
        for attempt in 1..=self.policy.attempts {
            let available = match self.replicas.available_replicas(tag).await {
                Ok(count) => count.unwrap_or(0),
                Err(e) => {
                    warn!(tag, attempt, error = %e, "deployment status unavailable, counting as 0");
                    0
                }
            };

            if available >= self.policy.min_available {
                info!(tag, attempt, available, "deployment available");
                return true;
            }

            if self.resolver.resolves(fqdn).await {
                info!(tag, attempt, fqdn, "host resolves");
                return true;
            }

            debug!(tag, attempt, available, "not ready");
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        warn!(tag, fqdn, "deployment did not become available");
        false
    }
}
