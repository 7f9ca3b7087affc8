//! Resolution of an inbound workload request to a single identity.
//!
//! Assignment records propagate in two steps: the record is written in
//! `Created`, and only once the node's attached-identity list is confirmed
//! does it advance to `Assigned`. A workload may ask for a token in the
//! window between the two, so resolution polls with a bounded, two-phase
//! budget rather than failing on the first miss.

use futures::future::Future;
use identity_controller_k8s_api::IdentityRef;
use std::pin::pin;
use tokio::time;

/// Identities assigned to one workload, bucketed by assignment phase.
#[derive(Clone, Debug, Default)]
pub struct PhasedIdentities {
    /// Records written without a phase, by older controller versions.
    /// Trusted like `assigned`.
    pub legacy: Vec<IdentityRef>,
    pub created: Vec<IdentityRef>,
    pub assigned: Vec<IdentityRef>,
}

/// Read access to the assignment records for a workload.
#[async_trait::async_trait]
pub trait AssignmentLookup: Send + Sync {
    async fn workload_identities(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<PhasedIdentities>;
}

#[derive(Copy, Clone, Debug)]
pub struct RetryBudget {
    /// Lookups spent waiting for any assignment to exist, in `Created` or
    /// better.
    pub created_attempts: u32,
    /// Further lookups spent waiting for an assignment to reach `Assigned`.
    pub assigned_attempts: u32,
    pub poll_interval: time::Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Phase A exhausted: no assignment exists for this workload at all, so
    /// it is not entitled to an identity. Maps to a forbidden response.
    #[error(
        "no identity is provisioned for workload {namespace}/{name} after {attempts} attempts"
    )]
    NotEntitled {
        namespace: String,
        name: String,
        attempts: u32,
    },

    /// Phase B exhausted: an assignment exists but has not been confirmed on
    /// the node yet. Maps to a retryable not-found response.
    #[error(
        "identity for workload {namespace}/{name} is still being provisioned after {attempts} attempts"
    )]
    Pending {
        namespace: String,
        name: String,
        attempts: u32,
    },

    /// The caller's cancellation signal fired mid-poll.
    #[error("identity resolution for workload {namespace}/{name} was cancelled")]
    Cancelled { namespace: String, name: String },
}

/// Polls assignment records until a matching identity is visible in the
/// right phase, within the configured budget.
#[derive(Clone, Debug)]
pub struct Resolver<L> {
    lookup: L,
    budget: RetryBudget,
    /// When set, only identities in the workload's own namespace are
    /// eligible.
    namespaced: bool,
}

impl<L: AssignmentLookup> Resolver<L> {
    pub fn new(lookup: L, budget: RetryBudget, namespaced: bool) -> Self {
        Self {
            lookup,
            budget,
            namespaced,
        }
    }

    /// Resolves the workload to exactly one identity record.
    ///
    /// `cancel` is the caller's cancellation signal (request deadline,
    /// process shutdown); when it fires the poll loop aborts immediately
    /// with [`ResolveError::Cancelled`].
    pub async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        client_id: Option<&str>,
        cancel: impl Future<Output = ()> + Send,
    ) -> Result<IdentityRef, ResolveError> {
        let total_attempts = self.budget.created_attempts + self.budget.assigned_attempts;
        let mut cancel = pin!(cancel);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.lookup.workload_identities(namespace, name).await {
                Ok(buckets) => {
                    let buckets = self.eligible(namespace, name, buckets);
                    if !buckets.legacy.is_empty() {
                        tracing::warn!(
                            %namespace, %name,
                            "workload matched assignments with no recorded phase; written by an older controller"
                        );
                    }
                    if let Some(identity) = pick(&buckets.legacy, client_id)
                        .or_else(|| pick(&buckets.assigned, client_id))
                    {
                        return Ok(identity.clone());
                    }

                    // Phase A: if nothing has even been created for this
                    // workload once the created budget is spent, it will
                    // never resolve.
                    if pick(&buckets.created, client_id).is_none()
                        && attempt >= self.budget.created_attempts
                    {
                        return Err(ResolveError::NotEntitled {
                            namespace: namespace.to_string(),
                            name: name.to_string(),
                            attempts: attempt,
                        });
                    }
                }
                Err(error) => {
                    tracing::debug!(%namespace, %name, %error, "assignment lookup failed");
                }
            }

            if attempt >= total_attempts {
                return Err(ResolveError::Pending {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    attempts: attempt,
                });
            }

            tokio::select! {
                _ = time::sleep(self.budget.poll_interval) => {}
                _ = &mut cancel => {
                    return Err(ResolveError::Cancelled {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    });
                }
            }
            tracing::debug!(%namespace, %name, attempt, "retrying identity resolution");
        }
    }

    fn eligible(&self, namespace: &str, name: &str, mut buckets: PhasedIdentities) -> PhasedIdentities {
        if !self.namespaced {
            return buckets;
        }
        for bucket in [
            &mut buckets.legacy,
            &mut buckets.created,
            &mut buckets.assigned,
        ] {
            bucket.retain(|id| {
                if id.namespace == namespace {
                    return true;
                }
                tracing::warn!(
                    workload = %format_args!("{namespace}/{name}"),
                    identity = %format_args!("{}/{}", id.namespace, id.name),
                    "ignoring identity outside the workload namespace"
                );
                false
            });
        }
        buckets
    }
}

/// Picks the first candidate; with a requested client id, the first whose
/// client id matches case-insensitively.
fn pick<'i>(candidates: &'i [IdentityRef], client_id: Option<&str>) -> Option<&'i IdentityRef> {
    match client_id {
        None => candidates.first(),
        Some(requested) => candidates
            .iter()
            .find(|id| id.spec.client_id.eq_ignore_ascii_case(requested)),
    }
}
