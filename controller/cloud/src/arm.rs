//! Thin REST client for the resource-manager API, used to read and write
//! compute resources. The async update operation is polled to completion
//! so callers observe a confirmed write, never an in-flight one.

use crate::{
    client::{ScaleSetApi, VirtualMachineApi},
    scale_set::VirtualMachineScaleSet,
    vm::VirtualMachine,
};
use anyhow::Context;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::{sync::Mutex, time};

const COMPUTE_API_VERSION: &str = "2023-03-01";
const OPERATION_POLL_DELAY: Duration = Duration::from_secs(5);
const OPERATION_POLL_LIMIT: u32 = 120;

/// Skew subtracted from a token's lifetime before it is considered stale.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub resource_group: String,

    /// Management-plane endpoint; overridden for sovereign clouds.
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,

    /// Directory login endpoint; overridden for sovereign clouds.
    #[serde(default = "default_authority")]
    pub authority: String,
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_authority() -> String {
    "https://login.microsoftonline.com".to_string()
}

impl ArmConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read cloud config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse cloud config {}", path.display()))
    }
}

pub struct ArmClient {
    http: reqwest::Client,
    config: ArmConfig,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    stale_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct OperationStatus {
    status: String,
}

impl ArmClient {
    pub fn new(config: ArmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.stale_at {
                return Ok(token.value.clone());
            }
        }

        let scope = format!("{}/.default", self.config.management_endpoint);
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", scope.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let token: TokenResponse = self
            .http
            .post(format!(
                "{}/{}/oauth2/v2.0/token",
                self.config.authority, self.config.tenant_id
            ))
            .form(&params)
            .send()
            .await
            .context("management token request failed")?
            .error_for_status()
            .context("management token request rejected")?
            .json()
            .await
            .context("malformed management token response")?;

        let lifetime = Duration::from_secs(token.expires_in)
            .saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            stale_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn resource_url(&self, kind: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/{kind}/{name}?api-version={COMPUTE_API_VERSION}",
            self.config.management_endpoint, self.config.subscription_id, self.config.resource_group,
        )
    }

    async fn get_resource<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        name: &str,
    ) -> anyhow::Result<T> {
        let bearer = self.bearer().await?;
        self.http
            .get(self.resource_url(kind, name))
            .bearer_auth(bearer)
            .send()
            .await
            .with_context(|| format!("failed to get {kind}/{name}"))?
            .error_for_status()
            .with_context(|| format!("get {kind}/{name} rejected"))?
            .json()
            .await
            .with_context(|| format!("malformed {kind}/{name} resource"))
    }

    async fn put_resource<T: serde::Serialize>(
        &self,
        kind: &str,
        name: &str,
        resource: &T,
    ) -> anyhow::Result<()> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .put(self.resource_url(kind, name))
            .bearer_auth(bearer)
            .json(resource)
            .send()
            .await
            .with_context(|| format!("failed to update {kind}/{name}"))?
            .error_for_status()
            .with_context(|| format!("update {kind}/{name} rejected"))?;

        // The update completes asynchronously; poll the operation until it
        // settles so a success here means the identity list is live.
        let operation = response
            .headers()
            .get("azure-asyncoperation")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(url) = operation {
            self.wait_for_operation(&url)
                .await
                .with_context(|| format!("update {kind}/{name} did not complete"))?;
        }
        Ok(())
    }

    async fn wait_for_operation(&self, url: &str) -> anyhow::Result<()> {
        for _ in 0..OPERATION_POLL_LIMIT {
            let bearer = self.bearer().await?;
            let status: OperationStatus = self
                .http
                .get(url)
                .bearer_auth(bearer)
                .send()
                .await
                .context("operation poll failed")?
                .error_for_status()
                .context("operation poll rejected")?
                .json()
                .await
                .context("malformed operation status")?;

            match status.status.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    anyhow::bail!("operation finished as {}", status.status)
                }
                state => {
                    tracing::debug!(%state, "waiting for update to settle");
                    time::sleep(OPERATION_POLL_DELAY).await;
                }
            }
        }
        anyhow::bail!("operation did not settle within the poll limit")
    }
}

#[async_trait::async_trait]
impl VirtualMachineApi for ArmClient {
    async fn get(&self, name: &str) -> anyhow::Result<VirtualMachine> {
        self.get_resource("virtualMachines", name).await
    }

    async fn update(&self, name: &str, vm: &VirtualMachine) -> anyhow::Result<()> {
        self.put_resource("virtualMachines", name, vm).await
    }
}

#[async_trait::async_trait]
impl ScaleSetApi for ArmClient {
    async fn get(&self, name: &str) -> anyhow::Result<VirtualMachineScaleSet> {
        self.get_resource("virtualMachineScaleSets", name).await
    }

    async fn update(&self, name: &str, scale_set: &VirtualMachineScaleSet) -> anyhow::Result<()> {
        self.put_resource("virtualMachineScaleSets", name, scale_set)
            .await
    }
}
