//! The singleton-node resource shape: attached identities are a map keyed
//! by resource id.

use crate::identity::{self, AssignmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<VmIdentity>,

    /// Everything else on the resource, carried through writes untouched.
    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmIdentity {
    #[serde(rename = "type")]
    pub assignment_type: AssignmentType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_assigned_identities: BTreeMap<String, serde_json::Value>,
}

impl VirtualMachine {
    pub fn attached_ids(&self) -> Vec<String> {
        self.identity
            .as_ref()
            .map(|id| id.user_assigned_identities.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Applies removals then additions; returns whether the resource
    /// changed and a write is required.
    pub fn apply(&mut self, additions: &[String], removals: &[String]) -> bool {
        let identity = self.identity.get_or_insert_with(VmIdentity::default);
        let mut ids = identity.user_assigned_identities.keys().cloned().collect();
        let changed = identity::apply_edits(
            &mut identity.assignment_type,
            &mut ids,
            additions,
            removals,
        );
        if changed {
            let mut next = BTreeMap::new();
            for id in ids {
                let value = identity
                    .user_assigned_identities
                    .remove(&id)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                next.insert(id, value);
            }
            identity.user_assigned_identities = next;
        }
        changed
    }
}
