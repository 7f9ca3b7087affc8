use crate::labels;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Associates a set of workloads, selected by label, with a `CloudIdentity`
/// in the same namespace.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "podidentity.k8s.io",
    version = "v1alpha1",
    kind = "IdentityBinding",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBindingSpec {
    pub selector: labels::Selector,

    /// Name of the bound `CloudIdentity`.
    pub identity: String,

    /// Breaks ties when several bindings select the same workload: the
    /// highest weight wins.
    #[serde(default)]
    pub weight: i32,
}
