#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod lease;

pub use self::args::Args;

use identity_controller_broker::WorkloadResolver;
use identity_controller_k8s_index::SharedIndex;
use std::net::IpAddr;

/// Adapts the shared index to the broker's source-address lookup.
#[derive(Clone)]
pub struct IndexWorkloads(SharedIndex);

impl IndexWorkloads {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl WorkloadResolver for IndexWorkloads {
    async fn workload_by_ip(&self, ip: IpAddr) -> anyhow::Result<Option<(String, String)>> {
        Ok(self
            .0
            .read()
            .workload_by_ip(&ip.to_string())
            .map(|id| (id.namespace, id.name)))
    }
}
