#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod assigned;
mod binding;
mod identity;
pub mod labels;

pub use self::{
    assigned::{
        assignment_name, AssignedIdentity, AssignedIdentitySpec, AssignedIdentityStatus,
        AssignmentPhase, BindingRef, IdentityRef, WorkloadRef,
    },
    binding::{IdentityBinding, IdentityBindingSpec},
    identity::{CloudIdentity, CloudIdentitySpec, IdentityType, SecretRef},
    labels::Labels,
};
pub use k8s_openapi::api::{
    self,
    core::v1::{Namespace, Node, Pod, PodSpec, PodStatus, Secret},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Error, Resource,
};

/// API group shared by all resources owned by this controller.
pub const API_GROUP: &str = "podidentity.k8s.io";

pub const API_VERSION: &str = "podidentity.k8s.io/v1alpha1";
