//! The node-pool resource shape: attached identities are a flat list of
//! resource ids.

use crate::identity::{self, AssignmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineScaleSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ScaleSetIdentity>,

    #[serde(flatten)]
    pub rest: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSetIdentity {
    #[serde(rename = "type")]
    pub assignment_type: AssignmentType,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_ids: Vec<String>,
}

impl VirtualMachineScaleSet {
    pub fn attached_ids(&self) -> Vec<String> {
        self.identity
            .as_ref()
            .map(|id| id.identity_ids.clone())
            .unwrap_or_default()
    }

    pub fn apply(&mut self, additions: &[String], removals: &[String]) -> bool {
        let identity = self.identity.get_or_insert_with(ScaleSetIdentity::default);
        identity::apply_edits(
            &mut identity.assignment_type,
            &mut identity.identity_ids,
            additions,
            removals,
        )
    }
}
