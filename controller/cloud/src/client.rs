//! The uniform contract over the two resource shapes, selected by a
//! runtime flag.

use crate::{scale_set::VirtualMachineScaleSet, vm::VirtualMachine};
use std::fmt;

/// Which compute resource kind the cluster's nodes are backed by.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    #[default]
    VirtualMachine,
    ScaleSet,
}

impl std::str::FromStr for NodeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "vm" => Ok(Self::VirtualMachine),
            "vmss" | "scale-set" => Ok(Self::ScaleSet),
            other => anyhow::bail!("unknown node kind {other:?} (expected `vm` or `vmss`)"),
        }
    }
}

/// The cloud resource a node's identity updates are written to. Multiple
/// scale-set nodes share one target, so identity work is grouped by this
/// rather than by node name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeTarget {
    pub kind: NodeKind,
    pub resource: String,
}

impl fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.resource.fmt(f)
    }
}

#[async_trait::async_trait]
pub trait VirtualMachineApi: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<VirtualMachine>;
    async fn update(&self, name: &str, vm: &VirtualMachine) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait ScaleSetApi: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<VirtualMachineScaleSet>;
    async fn update(&self, name: &str, scale_set: &VirtualMachineScaleSet) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct CloudClient<C> {
    api: C,
    kind: NodeKind,
}

impl<C> CloudClient<C>
where
    C: VirtualMachineApi + ScaleSetApi,
{
    pub fn new(api: C, kind: NodeKind) -> Self {
        Self { api, kind }
    }

    /// Maps a node name to the resource identity updates are written to.
    pub fn target_for(&self, node: &str) -> NodeTarget {
        let resource = match self.kind {
            NodeKind::VirtualMachine => node.to_string(),
            NodeKind::ScaleSet => scale_set_resource(node),
        };
        NodeTarget {
            kind: self.kind,
            resource,
        }
    }

    pub async fn attached_identities(&self, target: &NodeTarget) -> anyhow::Result<Vec<String>> {
        match target.kind {
            NodeKind::VirtualMachine => {
                Ok(VirtualMachineApi::get(&self.api, &target.resource)
                    .await?
                    .attached_ids())
            }
            NodeKind::ScaleSet => Ok(ScaleSetApi::get(&self.api, &target.resource)
                .await?
                .attached_ids()),
        }
    }

    /// Applies removals then additions to the target's attached-identity
    /// list in one read-modify-write. Returns whether a cloud write was
    /// issued; an edit that changes nothing never writes.
    pub async fn update_attached_identities(
        &self,
        target: &NodeTarget,
        additions: &[String],
        removals: &[String],
    ) -> anyhow::Result<bool> {
        match target.kind {
            NodeKind::VirtualMachine => {
                let mut vm = VirtualMachineApi::get(&self.api, &target.resource).await?;
                if !vm.apply(additions, removals) {
                    tracing::debug!(node = %target, "attached identities already converged");
                    return Ok(false);
                }
                VirtualMachineApi::update(&self.api, &target.resource, &vm).await?;
                Ok(true)
            }
            NodeKind::ScaleSet => {
                let mut scale_set = ScaleSetApi::get(&self.api, &target.resource).await?;
                if !scale_set.apply(additions, removals) {
                    tracing::debug!(node = %target, "attached identities already converged");
                    return Ok(false);
                }
                ScaleSetApi::update(&self.api, &target.resource, &scale_set).await?;
                Ok(true)
            }
        }
    }
}

/// Derives the scale-set resource name from a member node's name. Scale-set
/// node names end in the member's instance id; the resource is the common
/// prefix.
fn scale_set_resource(node: &str) -> String {
    let trailing_id = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if trailing_id == 0 || trailing_id == node.len() {
        return node.to_string();
    }
    node[..node.len() - trailing_id].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AssignmentType;
    use std::sync::Mutex;

    #[test]
    fn scale_set_resource_strips_instance_id() {
        assert_eq!(
            scale_set_resource("aks-nodepool1-vmss000000"),
            "aks-nodepool1-vmss",
        );
        assert_eq!(scale_set_resource("plain-node"), "plain-node");
    }

    #[derive(Default)]
    struct FakeApi {
        vm: Mutex<VirtualMachine>,
        writes: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl VirtualMachineApi for &FakeApi {
        async fn get(&self, _name: &str) -> anyhow::Result<VirtualMachine> {
            Ok(self.vm.lock().unwrap().clone())
        }

        async fn update(&self, _name: &str, vm: &VirtualMachine) -> anyhow::Result<()> {
            *self.vm.lock().unwrap() = vm.clone();
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ScaleSetApi for &FakeApi {
        async fn get(&self, _name: &str) -> anyhow::Result<VirtualMachineScaleSet> {
            unreachable!("vm-kind tests never touch scale sets")
        }

        async fn update(
            &self,
            _name: &str,
            _scale_set: &VirtualMachineScaleSet,
        ) -> anyhow::Result<()> {
            unreachable!("vm-kind tests never touch scale sets")
        }
    }

    #[tokio::test]
    async fn converged_update_skips_the_write() {
        let api = FakeApi::default();
        let client = CloudClient::new(&api, NodeKind::VirtualMachine);
        let target = client.target_for("n1");

        let id = "/subscriptions/s/rg/id1".to_string();
        assert!(client
            .update_attached_identities(&target, &[id.clone()], &[])
            .await
            .unwrap());
        assert_eq!(*api.writes.lock().unwrap(), 1);

        // Same addition again, in a different case: no write.
        assert!(!client
            .update_attached_identities(&target, &[id.to_uppercase()], &[])
            .await
            .unwrap());
        assert_eq!(*api.writes.lock().unwrap(), 1);

        assert!(client
            .update_attached_identities(&target, &[], &[id])
            .await
            .unwrap());
        assert_eq!(
            api.vm.lock().unwrap().identity.as_ref().unwrap().assignment_type,
            AssignmentType::None,
        );
    }
}
