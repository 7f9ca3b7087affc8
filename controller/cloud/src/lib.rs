#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Read/modify/write access to the attached-identity list of the compute
//! resources cluster nodes run on. Two resource kinds carry that list in
//! different shapes; everything above this crate sees one contract.

mod arm;
mod client;
pub mod identity;
mod scale_set;
mod vm;

pub use self::{
    arm::{ArmClient, ArmConfig},
    client::{CloudClient, NodeKind, NodeTarget, ScaleSetApi, VirtualMachineApi},
    identity::{contains_id, AssignmentType},
    scale_set::{ScaleSetIdentity, VirtualMachineScaleSet},
    vm::{VirtualMachine, VmIdentity},
};
