#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Maintains in-memory views of the cluster's workloads, bindings,
//! identities, and assignment records, and runs the reconciliation loop
//! that keeps assignment records and node identity lists in sync with
//! them.

mod index;
mod metrics;
mod plan;
mod resource_id;
mod store;
mod sync;


pub use self::{
    index::{Index, IndexLookup, SharedIndex},
    metrics::Metrics,
    plan::{plan, NodeOps, Plan, PlanParams, Snapshot, WorkloadEntry},
    resource_id::ResourceId,
    store::{AssignmentStore, KubeStore},
    sync::Reconciler,
};
