//! Attached-identity set arithmetic shared by both resource shapes.
//!
//! Identity resource ids are case-insensitive. Removals are applied before
//! additions so that an id present in both sets survives the edit.

use serde::{Deserialize, Serialize};

/// The identity-assignment flag carried by a compute resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentType {
    #[default]
    None,
    SystemAssigned,
    UserAssigned,
    #[serde(rename = "SystemAssigned, UserAssigned")]
    SystemAssignedUserAssigned,
}

impl AssignmentType {
    fn has_user_assigned(self) -> bool {
        matches!(
            self,
            Self::UserAssigned | Self::SystemAssignedUserAssigned
        )
    }

    fn has_system_assigned(self) -> bool {
        matches!(
            self,
            Self::SystemAssigned | Self::SystemAssignedUserAssigned
        )
    }

    /// The flag after the user-assigned list becomes empty.
    fn degraded(self) -> Self {
        if self.has_system_assigned() {
            Self::SystemAssigned
        } else {
            Self::None
        }
    }

    /// The flag after the user-assigned list becomes non-empty.
    fn upgraded(self) -> Self {
        if self.has_system_assigned() {
            Self::SystemAssignedUserAssigned
        } else {
            Self::UserAssigned
        }
    }
}

pub fn contains_id(ids: &[String], id: &str) -> bool {
    ids.iter().any(|existing| existing.eq_ignore_ascii_case(id))
}

/// Applies removals then additions to an attached-identity list, keeping
/// the assignment flag consistent with the result. Returns whether the
/// resource actually changed; `false` means no write is needed.
pub fn apply_edits(
    kind: &mut AssignmentType,
    ids: &mut Vec<String>,
    additions: &[String],
    removals: &[String],
) -> bool {
    let mut changed = false;

    if kind.has_user_assigned() {
        for removal in removals {
            if let Some(at) = ids
                .iter()
                .position(|existing| existing.eq_ignore_ascii_case(removal))
            {
                ids.remove(at);
                changed = true;
            }
        }
    }

    for addition in additions {
        if !contains_id(ids, addition) {
            ids.push(addition.clone());
            changed = true;
        }
    }

    let next = if ids.is_empty() {
        kind.degraded()
    } else {
        kind.upgraded()
    };
    if next != *kind {
        *kind = next;
        changed = true;
    }

    changed
}
