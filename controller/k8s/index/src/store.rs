//! Persistence of assignment records.

use identity_controller_k8s_api::{AssignedIdentity, AssignmentPhase};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};

/// The record store the reconciler writes and the broker's watch reads.
/// The reconciler is the sole writer.
#[async_trait::async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<AssignedIdentity>>;

    /// Creates the record in `Created`. Creating a record that already
    /// exists is not an error; reconciliation is re-entrant.
    async fn create(&self, assignment: &AssignedIdentity) -> anyhow::Result<()>;

    async fn set_phase(
        &self,
        assignment: &AssignedIdentity,
        phase: AssignmentPhase,
    ) -> anyhow::Result<()>;

    /// Deletes the record. A record that is already gone is not an error.
    async fn delete(&self, assignment: &AssignedIdentity) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, assignment: &AssignedIdentity) -> anyhow::Result<Api<AssignedIdentity>> {
        let namespace = assignment
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("assignment record has no namespace"))?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

fn name_of(assignment: &AssignedIdentity) -> anyhow::Result<&str> {
    assignment
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("assignment record has no name"))
}

fn patch_params() -> PatchParams {
    PatchParams::apply("identity-controller")
}

#[async_trait::async_trait]
impl AssignmentStore for KubeStore {
    async fn list(&self) -> anyhow::Result<Vec<AssignedIdentity>> {
        let api = Api::<AssignedIdentity>::all(self.client.clone());
        let assignments = api.list(&ListParams::default()).await?;
        Ok(assignments.items)
    }

    async fn create(&self, assignment: &AssignedIdentity) -> anyhow::Result<()> {
        let api = self.api(assignment)?;
        let name = name_of(assignment)?;

        match api.create(&PostParams::default(), assignment).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {
                tracing::debug!(%name, "assignment record already exists");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }

        // The status subresource must be written separately from create.
        let patch = serde_json::json!({"status": {"phase": AssignmentPhase::Created}});
        api.patch_status(name, &patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn set_phase(
        &self,
        assignment: &AssignedIdentity,
        phase: AssignmentPhase,
    ) -> anyhow::Result<()> {
        let api = self.api(assignment)?;
        let name = name_of(assignment)?;
        let patch = serde_json::json!({"status": {"phase": phase}});
        api.patch_status(name, &patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, assignment: &AssignedIdentity) -> anyhow::Result<()> {
        let api = self.api(assignment)?;
        let name = name_of(assignment)?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                tracing::debug!(%name, "assignment record already deleted");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}
