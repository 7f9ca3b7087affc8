use crate::{plan::Snapshot, resource_id::ResourceId};
use ahash::AHashMap as HashMap;
use identity_controller_core::retrieval::PhasedIdentities;
use identity_controller_k8s_api::{
    self as k8s, AssignedIdentity, AssignmentPhase, CloudIdentitySpec, IdentityBindingSpec,
    ResourceExt,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// In-memory view of the resources reconciliation reads, fed by watches.
///
/// Every change nudges the reconciler through a coalescing channel; the
/// periodic tick covers anything a nudge misses.
pub struct Index {
    workloads: HashMap<ResourceId, Workload>,
    workloads_by_ip: HashMap<String, ResourceId>,
    bindings: HashMap<ResourceId, IdentityBindingSpec>,
    identities: HashMap<ResourceId, CloudIdentitySpec>,
    assignments: HashMap<ResourceId, AssignedIdentity>,

    changes: mpsc::Sender<()>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Workload {
    pub node: Option<String>,
    pub labels: k8s::Labels,
    pub ip: Option<String>,
}

impl Index {
    pub fn shared(changes: mpsc::Sender<()>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            workloads: HashMap::new(),
            workloads_by_ip: HashMap::new(),
            bindings: HashMap::new(),
            identities: HashMap::new(),
            assignments: HashMap::new(),
            changes,
        }))
    }

    /// Clones the reconciler's inputs out of the index so a cycle runs
    /// against a consistent view without holding the lock.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            workloads: self
                .workloads
                .iter()
                .map(|(id, w)| crate::plan::WorkloadEntry {
                    id: id.clone(),
                    node: w.node.clone(),
                    labels: w.labels.clone(),
                })
                .collect(),
            bindings: self
                .bindings
                .iter()
                .map(|(id, b)| (id.clone(), b.clone()))
                .collect(),
            identities: self
                .identities
                .iter()
                .map(|(id, spec)| (id.clone(), spec.clone()))
                .collect(),
        }
    }

    /// Resolves a source address to the workload it belongs to.
    pub fn workload_by_ip(&self, ip: &str) -> Option<ResourceId> {
        self.workloads_by_ip.get(ip).cloned()
    }

    /// Buckets the identities assigned to a workload by phase, for the
    /// token broker's resolution loop.
    pub fn workload_identities(&self, namespace: &str, name: &str) -> PhasedIdentities {
        let mut buckets = PhasedIdentities::default();
        for assignment in self.assignments.values() {
            let workload = &assignment.spec.workload;
            if workload.namespace != namespace || workload.name != name {
                continue;
            }
            let identity = assignment.spec.identity.clone();
            match assignment.status.as_ref().and_then(|s| s.phase) {
                None => buckets.legacy.push(identity),
                Some(AssignmentPhase::Created) => buckets.created.push(identity),
                Some(AssignmentPhase::Assigned) => buckets.assigned.push(identity),
            }
        }
        buckets
    }

    fn poke(&self) {
        // A full channel already has a wakeup pending; dropping this one
        // loses nothing.
        let _ = self.changes.try_send(());
    }
}

/// The broker's resolution loop polls the index's view of assignment
/// records.
#[derive(Clone)]
pub struct IndexLookup(SharedIndex);

impl IndexLookup {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl identity_controller_core::retrieval::AssignmentLookup for IndexLookup {
    async fn workload_identities(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<PhasedIdentities> {
        Ok(self.0.read().workload_identities(namespace, name))
    }
}

// === indexing ===

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("pod must have a namespace");
        let name = pod.name_unchecked();
        let id = ResourceId::new(namespace, name);

        let workload = Workload {
            node: pod.spec.and_then(|spec| spec.node_name),
            labels: pod.metadata.labels.into(),
            ip: pod.status.and_then(|status| status.pod_ip),
        };
        if let Some(ip) = workload.ip.clone() {
            self.workloads_by_ip.insert(ip, id.clone());
        }
        match self.workloads.insert(id, workload.clone()) {
            Some(previous) if previous == workload => {}
            previous => {
                if let Some(stale) = previous.and_then(|w| w.ip).filter(|ip| {
                    workload.ip.as_deref() != Some(ip.as_str())
                }) {
                    self.workloads_by_ip.remove(&stale);
                }
                self.poke();
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if let Some(workload) = self.workloads.remove(&id) {
            if let Some(ip) = workload.ip {
                if self.workloads_by_ip.get(&ip) == Some(&id) {
                    self.workloads_by_ip.remove(&ip);
                }
            }
            self.poke();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::CloudIdentity> for Index {
    fn apply(&mut self, identity: k8s::CloudIdentity) {
        let namespace = identity.namespace().expect("identity must have a namespace");
        let name = identity.name_unchecked();
        let id = ResourceId::new(namespace, name);

        if self.identities.insert(id, identity.spec.clone()) != Some(identity.spec) {
            self.poke();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .identities
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.poke();
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::IdentityBinding> for Index {
    fn apply(&mut self, binding: k8s::IdentityBinding) {
        let namespace = binding.namespace().expect("binding must have a namespace");
        let name = binding.name_unchecked();
        let id = ResourceId::new(namespace, name);

        if self.bindings.insert(id, binding.spec.clone()) != Some(binding.spec) {
            self.poke();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self
            .bindings
            .remove(&ResourceId::new(namespace, name))
            .is_some()
        {
            self.poke();
        }
    }
}

impl kubert::index::IndexNamespacedResource<AssignedIdentity> for Index {
    fn apply(&mut self, assignment: AssignedIdentity) {
        let namespace = assignment
            .namespace()
            .expect("assignment must have a namespace");
        let name = assignment.name_unchecked();
        // The reconciler is the sole writer of assignments, so its own
        // watch only keeps the broker's view current; it never pokes the
        // loop.
        self.assignments
            .insert(ResourceId::new(namespace, name), assignment);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.assignments.remove(&ResourceId::new(namespace, name));
    }
}
