#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dispatch;
pub mod retrieval;

pub use self::{
    dispatch::{AcquireError, Dispatcher, SecretStore, Token, TokenIssuer},
    retrieval::{AssignmentLookup, PhasedIdentities, ResolveError, Resolver, RetryBudget},
};

pub const CONTROLLER_NAME: &str = "podidentity.k8s.io/identity-controller";

/// Redacts a client identifier for logging, keeping a short prefix so
/// operators can still correlate entries.
pub fn redact_client_id(id: &str) -> String {
    let keep = id.len().min(4);
    format!("{}##### REDACTED #####", &id[..keep])
}
