use crate::identity::CloudIdentitySpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The materialized decision that a workload uses an identity on a node.
///
/// Records are created in `Created` and advanced to `Assigned` once the
/// node's attached-identity list is confirmed to hold the identity. The
/// phase never moves backwards.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "podidentity.k8s.io",
    version = "v1alpha1",
    kind = "AssignedIdentity",
    namespaced,
    status = "AssignedIdentityStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AssignedIdentitySpec {
    pub identity: IdentityRef,
    pub binding: BindingRef,
    pub workload: WorkloadRef,
    pub node: String,
}

/// Reference to the source identity, carrying a snapshot of its spec so
/// that token requests do not depend on the identity still being listable.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRef {
    pub namespace: String,
    pub name: String,
    pub spec: CloudIdentitySpec,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignedIdentityStatus {
    /// Absent on records written by pre-phase versions of the controller;
    /// readers treat that as `Assigned`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<AssignmentPhase>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
pub enum AssignmentPhase {
    Created,
    Assigned,
}

impl AssignedIdentity {
    /// The phase recorded on this assignment, defaulting absent status to
    /// `Assigned` for backward compatibility.
    pub fn phase(&self) -> AssignmentPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(AssignmentPhase::Assigned)
    }
}

impl fmt::Display for AssignmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => "Created".fmt(f),
            Self::Assigned => "Assigned".fmt(f),
        }
    }
}

/// Derives the name of the assignment record for a (workload, identity)
/// pair. The same inputs always produce the same name, so repeated
/// reconciliation converges on one record per pair.
pub fn assignment_name(workload_name: &str, workload_ns: &str, identity_name: &str) -> String {
    format!("{workload_name}-{workload_ns}-{identity_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_deterministic() {
        assert_eq!(assignment_name("w1", "ns", "id-a"), "w1-ns-id-a");
        assert_eq!(
            assignment_name("w1", "ns", "id-a"),
            assignment_name("w1", "ns", "id-a"),
        );
    }

    #[test]
    fn phase_ordering_is_monotonic() {
        assert!(AssignmentPhase::Created < AssignmentPhase::Assigned);
    }

    #[test]
    fn missing_status_reads_as_assigned() {
        let assigned = AssignedIdentity::new(
            "w1-ns-id-a",
            AssignedIdentitySpec {
                identity: IdentityRef {
                    namespace: "ns".to_string(),
                    name: "id-a".to_string(),
                    spec: crate::CloudIdentitySpec {
                        identity_type: crate::IdentityType::UserAssigned,
                        resource_id: Some("/subscriptions/s/x".to_string()),
                        client_id: "c1".to_string(),
                        tenant_id: None,
                        secret_ref: None,
                    },
                },
                binding: BindingRef {
                    namespace: "ns".to_string(),
                    name: "b1".to_string(),
                },
                workload: WorkloadRef {
                    namespace: "ns".to_string(),
                    name: "w1".to_string(),
                },
                node: "n1".to_string(),
            },
        );
        assert_eq!(assigned.phase(), AssignmentPhase::Assigned);
    }
}
