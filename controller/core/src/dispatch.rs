//! Token acquisition for a resolved identity.
//!
//! Each identity type maps to one acquisition strategy; the cryptography
//! and wire protocol live behind [`TokenIssuer`], which is consumed as a
//! black box.

use crate::redact_client_id;
use identity_controller_k8s_api::{IdentityRef, IdentityType, SecretRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A credential document, in the shape the node-local metadata endpoint
/// hands out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: String,
    #[serde(default)]
    pub expires_on: String,
    #[serde(default)]
    pub not_before: String,
    #[serde(default)]
    pub resource: String,
    pub token_type: String,
}

/// The external token-issuance API.
#[async_trait::async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Requests a token from the node's managed-identity endpoint for a
    /// user-assigned identity.
    async fn user_assigned_token(&self, client_id: &str, resource: &str)
        -> anyhow::Result<Token>;

    async fn service_principal_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        secret: &str,
        resource: &str,
    ) -> anyhow::Result<Token>;

    async fn certificate_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        certificate: &[u8],
        passphrase: &str,
        resource: &str,
    ) -> anyhow::Result<Token>;
}

/// Read access to secrets referenced by service-principal identities.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn secret_data(&self, secret: &SecretRef) -> anyhow::Result<BTreeMap<String, Vec<u8>>>;
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The identity record itself is unusable; retrying cannot help.
    #[error("identity {namespace}/{name} is misconfigured: {reason}")]
    Config {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("failed to read secret {namespace}/{name}: {reason}")]
    Secret {
        namespace: String,
        name: String,
        reason: anyhow::Error,
    },

    #[error("token issuance failed: {0}")]
    Issuer(anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct Dispatcher<I, S> {
    issuer: I,
    secrets: S,
}

impl<I, S> Dispatcher<I, S>
where
    I: TokenIssuer,
    S: SecretStore,
{
    pub fn new(issuer: I, secrets: S) -> Self {
        Self { issuer, secrets }
    }

    /// Acquires a token for the resolved identity.
    ///
    /// The resolution step already picked the authoritative identity; a
    /// requested client id that differs is logged but never substituted
    /// and never fails the request.
    pub async fn acquire(
        &self,
        identity: &IdentityRef,
        requested_client_id: Option<&str>,
        resource: &str,
    ) -> Result<Token, AcquireError> {
        let spec = &identity.spec;
        if let Some(requested) = requested_client_id {
            if !requested.eq_ignore_ascii_case(&spec.client_id) {
                tracing::warn!(
                    requested = %redact_client_id(requested),
                    resolved = %redact_client_id(&spec.client_id),
                    "client id mismatch; proceeding with the resolved identity"
                );
            }
        }

        match spec.identity_type {
            IdentityType::UserAssigned => {
                tracing::info!(
                    identity_type = ?spec.identity_type,
                    client_id = %redact_client_id(&spec.client_id),
                    %resource,
                    "acquiring managed-identity token"
                );
                self.issuer
                    .user_assigned_token(&spec.client_id, resource)
                    .await
                    .map_err(AcquireError::Issuer)
            }

            IdentityType::ServicePrincipalPassword => {
                let tenant_id = self.tenant_id(identity)?;
                let data = self.secret(identity).await?;
                // The secret is expected to hold exactly one value: the
                // password.
                let password = data
                    .values()
                    .next()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .ok_or_else(|| self.config_error(identity, "referenced secret is empty"))?;
                tracing::info!(
                    identity_type = ?spec.identity_type,
                    %tenant_id,
                    client_id = %redact_client_id(&spec.client_id),
                    %resource,
                    "acquiring service-principal token"
                );
                self.issuer
                    .service_principal_token(&tenant_id, &spec.client_id, &password, resource)
                    .await
                    .map_err(AcquireError::Issuer)
            }

            IdentityType::ServicePrincipalCertificate => {
                let tenant_id = self.tenant_id(identity)?;
                let data = self.secret(identity).await?;
                let certificate = data.get("certificate").cloned().ok_or_else(|| {
                    self.config_error(identity, "referenced secret has no `certificate` key")
                })?;
                let passphrase = data
                    .get("password")
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                tracing::info!(
                    identity_type = ?spec.identity_type,
                    %tenant_id,
                    client_id = %redact_client_id(&spec.client_id),
                    %resource,
                    "acquiring certificate token"
                );
                self.issuer
                    .certificate_token(
                        &tenant_id,
                        &spec.client_id,
                        &certificate,
                        &passphrase,
                        resource,
                    )
                    .await
                    .map_err(AcquireError::Issuer)
            }
        }
    }

    fn tenant_id(&self, identity: &IdentityRef) -> Result<String, AcquireError> {
        match identity.spec.tenant_id.as_deref() {
            Some(tenant) if !tenant.is_empty() => Ok(tenant.to_string()),
            _ => Err(self.config_error(identity, "service principal identity has no tenantId")),
        }
    }

    async fn secret(
        &self,
        identity: &IdentityRef,
    ) -> Result<BTreeMap<String, Vec<u8>>, AcquireError> {
        let secret_ref = identity
            .spec
            .secret_ref
            .as_ref()
            .ok_or_else(|| self.config_error(identity, "service principal identity has no secretRef"))?;
        self.secrets
            .secret_data(secret_ref)
            .await
            .map_err(|reason| AcquireError::Secret {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
                reason,
            })
    }

    fn config_error(&self, identity: &IdentityRef, reason: &str) -> AcquireError {
        AcquireError::Config {
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_controller_k8s_api::CloudIdentitySpec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIssuer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TokenIssuer for &RecordingIssuer {
        async fn user_assigned_token(
            &self,
            client_id: &str,
            resource: &str,
        ) -> anyhow::Result<Token> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("msi:{client_id}:{resource}"));
            Ok(Token {
                access_token: "t".to_string(),
                token_type: "Bearer".to_string(),
                ..Default::default()
            })
        }

        async fn service_principal_token(
            &self,
            tenant_id: &str,
            client_id: &str,
            secret: &str,
            resource: &str,
        ) -> anyhow::Result<Token> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("sp:{tenant_id}:{client_id}:{secret}:{resource}"));
            Ok(Token::default())
        }

        async fn certificate_token(
            &self,
            tenant_id: &str,
            client_id: &str,
            certificate: &[u8],
            passphrase: &str,
            resource: &str,
        ) -> anyhow::Result<Token> {
            self.calls.lock().unwrap().push(format!(
                "cert:{tenant_id}:{client_id}:{}:{passphrase}:{resource}",
                certificate.len()
            ));
            Ok(Token::default())
        }
    }

    struct StaticSecrets(BTreeMap<String, Vec<u8>>);

    #[async_trait::async_trait]
    impl SecretStore for &StaticSecrets {
        async fn secret_data(
            &self,
            _secret: &SecretRef,
        ) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
            Ok(self.0.clone())
        }
    }

    fn identity(identity_type: IdentityType) -> IdentityRef {
        IdentityRef {
            namespace: "ns".to_string(),
            name: "id-a".to_string(),
            spec: CloudIdentitySpec {
                identity_type,
                resource_id: Some("/subscriptions/s/id-a".to_string()),
                client_id: "c1".to_string(),
                tenant_id: Some("t1".to_string()),
                secret_ref: Some(SecretRef {
                    namespace: "ns".to_string(),
                    name: "sp-secret".to_string(),
                }),
            },
        }
    }

    #[tokio::test]
    async fn user_assigned_uses_resolved_client_id_on_mismatch() {
        let issuer = RecordingIssuer::default();
        let secrets = StaticSecrets(BTreeMap::new());
        let dispatcher = Dispatcher::new(&issuer, &secrets);

        dispatcher
            .acquire(
                &identity(IdentityType::UserAssigned),
                Some("someone-else"),
                "https://vault.example.net",
            )
            .await
            .unwrap();

        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["msi:c1:https://vault.example.net"]);
    }

    #[tokio::test]
    async fn password_strategy_extracts_the_secret_value() {
        let issuer = RecordingIssuer::default();
        let secrets = StaticSecrets(
            [("value".to_string(), b"hunter2".to_vec())]
                .into_iter()
                .collect(),
        );
        Dispatcher::new(&issuer, &secrets)
            .acquire(
                &identity(IdentityType::ServicePrincipalPassword),
                None,
                "r1",
            )
            .await
            .unwrap();

        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["sp:t1:c1:hunter2:r1"]);
    }

    #[tokio::test]
    async fn certificate_strategy_requires_certificate_key() {
        let issuer = RecordingIssuer::default();
        let secrets = StaticSecrets(
            [("password".to_string(), b"pw".to_vec())]
                .into_iter()
                .collect(),
        );
        let err = Dispatcher::new(&issuer, &secrets)
            .acquire(
                &identity(IdentityType::ServicePrincipalCertificate),
                None,
                "r1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Config { .. }));
    }

    #[tokio::test]
    async fn certificate_strategy_passes_certificate_and_passphrase() {
        let issuer = RecordingIssuer::default();
        let secrets = StaticSecrets(
            [
                ("certificate".to_string(), vec![1u8; 16]),
                ("password".to_string(), b"pw".to_vec()),
            ]
            .into_iter()
            .collect(),
        );
        Dispatcher::new(&issuer, &secrets)
            .acquire(
                &identity(IdentityType::ServicePrincipalCertificate),
                None,
                "r1",
            )
            .await
            .unwrap();

        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["cert:t1:c1:16:pw:r1"]);
    }

    #[tokio::test]
    async fn missing_tenant_is_a_config_error() {
        let issuer = RecordingIssuer::default();
        let secrets = StaticSecrets(BTreeMap::new());
        let mut id = identity(IdentityType::ServicePrincipalPassword);
        id.spec.tenant_id = None;
        let err = Dispatcher::new(&issuer, &secrets)
            .acquire(&id, None, "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Config { .. }));
        assert!(issuer.calls.lock().unwrap().is_empty());
    }
}
