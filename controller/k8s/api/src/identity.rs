use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes a cloud credential definition that workloads may be bound to.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "podidentity.k8s.io",
    version = "v1alpha1",
    kind = "CloudIdentity",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CloudIdentitySpec {
    #[serde(rename = "type")]
    pub identity_type: IdentityType,

    /// Cloud resource path of the user-assigned identity. Required for
    /// `UserAssigned`; ignored for the service-principal variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    pub client_id: String,

    /// Directory tenant for the service-principal variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Secret holding the service principal's password or certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// The credential-acquisition strategy for an identity.
///
/// An unrecognized value fails deserialization, which callers treat as a
/// configuration error scoped to that one resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum IdentityType {
    UserAssigned,
    ServicePrincipalPassword,
    ServicePrincipalCertificate,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl CloudIdentitySpec {
    /// Validates the parts of the spec that serde cannot: strategy-specific
    /// required fields.
    pub fn validate(&self) -> Result<(), InvalidIdentity> {
        match self.identity_type {
            IdentityType::UserAssigned => match self.resource_id.as_deref() {
                None | Some("") => Err(InvalidIdentity::MissingResourceId),
                Some(id) if !is_resource_path(id) => {
                    Err(InvalidIdentity::MalformedResourceId(id.to_string()))
                }
                Some(_) => Ok(()),
            },
            IdentityType::ServicePrincipalPassword | IdentityType::ServicePrincipalCertificate => {
                if self.tenant_id.as_deref().unwrap_or_default().is_empty() {
                    return Err(InvalidIdentity::MissingTenantId);
                }
                if self.secret_ref.is_none() {
                    return Err(InvalidIdentity::MissingSecretRef);
                }
                Ok(())
            }
        }
    }
}

/// A full ARM-style resource path:
/// `/subscriptions/<sub>/resourceGroups/<rg>/providers/...`.
fn is_resource_path(id: &str) -> bool {
    let mut parts = id.split('/');
    parts.next() == Some("")
        && parts
            .next()
            .is_some_and(|p| p.eq_ignore_ascii_case("subscriptions"))
        && parts.next().is_some_and(|p| !p.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidIdentity {
    MissingResourceId,
    MalformedResourceId(String),
    MissingTenantId,
    MissingSecretRef,
}

impl fmt::Display for InvalidIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingResourceId => write!(f, "user-assigned identity has no resourceId"),
            Self::MalformedResourceId(id) => write!(f, "malformed resourceId {id:?}"),
            Self::MissingTenantId => write!(f, "service principal identity has no tenantId"),
            Self::MissingSecretRef => write!(f, "service principal identity has no secretRef"),
        }
    }
}

impl std::error::Error for InvalidIdentity {}
