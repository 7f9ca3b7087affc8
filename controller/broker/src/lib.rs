#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The node-local token broker: receives redirected metadata-endpoint
//! traffic from workloads, resolves the caller to an identity through the
//! assignment records, and relays a token from the issuance API.

mod issuer;
mod server;

pub use self::{
    issuer::{KubeSecrets, StandardIssuer},
    server::{Broker, WorkloadResolver},
};
