//! Pure planning for one reconciliation cycle: desired assignments are
//! derived from (workloads × bindings × identities), diffed against the
//! records that exist, and grouped into per-node work. No I/O happens
//! here; the sync driver applies the result.

use crate::resource_id::ResourceId;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use identity_controller_cloud::NodeTarget;
use identity_controller_k8s_api::{
    self as k8s, assignment_name, AssignedIdentity, AssignedIdentitySpec, AssignmentPhase,
    BindingRef, CloudIdentitySpec, IdentityBindingSpec, IdentityRef, IdentityType, ObjectMeta,
    WorkloadRef,
};
use std::collections::BTreeMap;

/// Node label stamped on assignment records so per-node listing stays
/// cheap.
pub(crate) const NODE_LABEL: &str = "podidentity.k8s.io/node";

/// The reconciler's inputs, cloned out of the index.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub workloads: Vec<WorkloadEntry>,
    pub bindings: Vec<(ResourceId, IdentityBindingSpec)>,
    pub identities: HashMap<ResourceId, CloudIdentitySpec>,
}

#[derive(Clone, Debug)]
pub struct WorkloadEntry {
    pub id: ResourceId,
    pub node: Option<String>,
    pub labels: k8s::Labels,
}

#[derive(Clone, Debug, Default)]
pub struct PlanParams {
    /// Namespace-isolated mode: a binding only applies when the workload,
    /// binding, and identity share a namespace.
    pub namespaced: bool,

    /// Client ids (lowercased) that are never detached from nodes, even
    /// when unreferenced.
    pub immutable_client_ids: HashSet<String>,
}

/// Work for one cycle, grouped by the cloud resource it lands on.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub nodes: BTreeMap<NodeTarget, NodeOps>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeOps {
    /// Identity resource ids to attach, deduplicated.
    pub additions: Vec<String>,
    /// Identity resource ids to detach, deduplicated and reference-checked.
    pub removals: Vec<String>,

    /// Records to create in `Created`, then advance once the node write is
    /// confirmed.
    pub create: Vec<AssignedIdentity>,
    /// Existing `Created` records whose node write is being retried;
    /// advanced on confirmation.
    pub advance: Vec<AssignedIdentity>,
    /// Records to delete, only after the node write is confirmed.
    pub delete: Vec<AssignedIdentity>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ops(&mut self, target: NodeTarget) -> &mut NodeOps {
        self.nodes.entry(target).or_default()
    }
}

pub fn plan(
    snapshot: &Snapshot,
    current: &[AssignedIdentity],
    params: &PlanParams,
    target_for: impl Fn(&str) -> NodeTarget,
) -> Plan {
    let desired = desired_assignments(snapshot, params);

    let current_by_id: HashMap<ResourceId, &AssignedIdentity> = current
        .iter()
        .filter_map(|a| {
            let ns = a.metadata.namespace.as_deref()?;
            let name = a.metadata.name.as_deref()?;
            Some((ResourceId::new(ns.to_string(), name.to_string()), a))
        })
        .collect();

    let mut plan = Plan::default();

    for (id, desired_record) in &desired {
        match current_by_id.get(id) {
            None => {
                let target = target_for(&desired_record.spec.node);
                plan.ops(target).create.push(desired_record.clone());
            }
            Some(existing) if existing.spec == desired_record.spec => {
                if existing.phase() == AssignmentPhase::Created {
                    // The record exists but the node write has not been
                    // confirmed; retry it.
                    let target = target_for(&existing.spec.node);
                    plan.ops(target).advance.push((*existing).clone());
                }
            }
            Some(existing) => {
                // The workload moved nodes or its identity/binding changed:
                // delete the stale record and create a fresh one. Records
                // are never mutated across nodes.
                let old_target = target_for(&existing.spec.node);
                plan.ops(old_target).delete.push((*existing).clone());
                let new_target = target_for(&desired_record.spec.node);
                plan.ops(new_target).create.push(desired_record.clone());
            }
        }
    }

    for (id, existing) in &current_by_id {
        if !desired.contains_key(id) {
            let target = target_for(&existing.spec.node);
            plan.ops(target).delete.push((*existing).clone());
        }
    }

    // Per-target attach/detach lists follow from the record work.
    for (target, ops) in plan.nodes.iter_mut() {
        let mut additions = Vec::new();
        for record in ops.create.iter().chain(ops.advance.iter()) {
            if let Some(resource_id) = attachable_resource_id(&record.spec.identity.spec) {
                push_unique(&mut additions, resource_id);
            }
        }
        ops.additions = additions;

        let mut removals = Vec::new();
        for record in &ops.delete {
            let identity = &record.spec.identity;
            let Some(resource_id) = attachable_resource_id(&identity.spec) else {
                continue;
            };
            if params
                .immutable_client_ids
                .contains(&identity.spec.client_id.to_lowercase())
            {
                tracing::debug!(%target, identity = %identity.name, "identity is immutable; leaving it attached");
                continue;
            }
            // Reference counting: the id stays attached while any desired
            // assignment on this target still references it.
            let referenced = desired.values().any(|d| {
                target_for(&d.spec.node) == *target
                    && d.spec
                        .identity
                        .spec
                        .resource_id
                        .as_deref()
                        .is_some_and(|r| r.eq_ignore_ascii_case(resource_id))
            });
            if !referenced {
                push_unique(&mut removals, resource_id);
            }
        }
        ops.removals = removals;

        ops.delete.sort_by(record_order);
        ops.create.sort_by(record_order);
        ops.advance.sort_by(record_order);
    }

    plan.nodes.retain(|_, ops| {
        !(ops.additions.is_empty()
            && ops.removals.is_empty()
            && ops.create.is_empty()
            && ops.advance.is_empty()
            && ops.delete.is_empty())
    });

    plan
}

/// Computes the desired assignment set: one record per workload whose
/// labels match a binding, using the binding's identity, keyed by the
/// deterministic assignment name.
fn desired_assignments(
    snapshot: &Snapshot,
    params: &PlanParams,
) -> HashMap<ResourceId, AssignedIdentity> {
    let mut desired = HashMap::new();

    for workload in &snapshot.workloads {
        let Some(node) = workload.node.as_deref() else {
            tracing::debug!(workload = %workload.id, "workload has no node yet; skipping");
            continue;
        };

        // Highest weight wins; equal weights break ties toward the
        // lexicographically first binding so the choice is stable across
        // cycles.
        let best = snapshot
            .bindings
            .iter()
            .filter(|(_, spec)| spec.selector.matches(&workload.labels))
            .max_by(|(a_id, a), (b_id, b)| a.weight.cmp(&b.weight).then_with(|| b_id.cmp(a_id)));
        let Some((binding_id, binding)) = best else {
            continue;
        };

        let identity_id = ResourceId::new(binding_id.namespace.clone(), binding.identity.clone());
        let Some(identity_spec) = snapshot.identities.get(&identity_id) else {
            tracing::debug!(
                binding = %binding_id,
                identity = %identity_id,
                "bound identity does not exist; skipping"
            );
            continue;
        };

        if let Err(error) = identity_spec.validate() {
            tracing::error!(identity = %identity_id, %error, "ignoring misconfigured identity");
            continue;
        }

        if params.namespaced
            && !(identity_id.namespace == binding_id.namespace
                && binding_id.namespace == workload.id.namespace)
        {
            tracing::debug!(
                workload = %workload.id,
                binding = %binding_id,
                identity = %identity_id,
                "namespace isolation is enforced; skipping cross-namespace match"
            );
            continue;
        }

        let name = assignment_name(&workload.id.name, &workload.id.namespace, &identity_id.name);
        let record = make_assignment(
            &name,
            workload,
            node,
            binding_id,
            &identity_id,
            identity_spec.clone(),
        );
        desired.insert(
            ResourceId::new(workload.id.namespace.clone(), name),
            record,
        );
    }

    desired
}

fn make_assignment(
    name: &str,
    workload: &WorkloadEntry,
    node: &str,
    binding_id: &ResourceId,
    identity_id: &ResourceId,
    identity_spec: CloudIdentitySpec,
) -> AssignedIdentity {
    AssignedIdentity {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(workload.id.namespace.clone()),
            labels: Some(
                Some((NODE_LABEL.to_string(), node.to_string()))
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: AssignedIdentitySpec {
            identity: IdentityRef {
                namespace: identity_id.namespace.clone(),
                name: identity_id.name.clone(),
                spec: identity_spec,
            },
            binding: BindingRef {
                namespace: binding_id.namespace.clone(),
                name: binding_id.name.clone(),
            },
            workload: WorkloadRef {
                namespace: workload.id.namespace.clone(),
                name: workload.id.name.clone(),
            },
            node: node.to_string(),
        },
        status: None,
    }
}

/// Only user-assigned identities occupy a slot on the node's
/// attached-identity list.
fn attachable_resource_id(spec: &CloudIdentitySpec) -> Option<&str> {
    if spec.identity_type != IdentityType::UserAssigned {
        return None;
    }
    spec.resource_id.as_deref()
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !identity_controller_cloud::contains_id(ids, id) {
        ids.push(id.to_string());
    }
}

fn record_order(a: &AssignedIdentity, b: &AssignedIdentity) -> std::cmp::Ordering {
    (a.metadata.namespace.as_deref(), a.metadata.name.as_deref())
        .cmp(&(b.metadata.namespace.as_deref(), b.metadata.name.as_deref()))
}
