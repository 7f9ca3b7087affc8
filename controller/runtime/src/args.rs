use crate::{lease, IndexWorkloads};
use anyhow::{bail, Context, Result};
use clap::Parser;
use identity_controller_broker::{Broker, KubeSecrets, StandardIssuer};
use identity_controller_cloud::{ArmClient, ArmConfig, CloudClient, NodeKind};
use identity_controller_core::{retrieval::RetryBudget, Dispatcher, Resolver};
use identity_controller_k8s_api as k8s;
use identity_controller_k8s_index as index;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

/// The number of change nudges buffered for the reconciler. Nudges
/// coalesce, so this only needs to absorb a burst.
const CHANGE_QUEUE_SIZE: usize = 100;

#[derive(Debug, Parser)]
#[clap(name = "identity-controller", about = "A workload identity controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "identity_controller=info,warn",
        env = "IDENTITY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the reconciliation control loop.
    #[clap(long)]
    reconcile_disabled: bool,

    /// Disables the token broker endpoint.
    #[clap(long)]
    broker_disabled: bool,

    #[clap(long, default_value = "0.0.0.0:2579")]
    broker_addr: SocketAddr,

    /// Interval between periodic reconciliation cycles.
    #[clap(long, default_value = "30")]
    sync_period_seconds: u64,

    /// Resolution attempts spent waiting for an assignment record to
    /// exist at all.
    #[clap(long, default_value = "16")]
    created_retry_attempts: u32,

    /// Further resolution attempts spent waiting for an assignment to be
    /// confirmed on the node.
    #[clap(long, default_value = "4")]
    assigned_retry_attempts: u32,

    #[clap(long, default_value = "5")]
    retry_interval_seconds: u64,

    /// Restrict identity matches to the workload's own namespace.
    #[clap(long)]
    namespaced: bool,

    /// The compute resource kind backing cluster nodes: `vm` or `vmss`.
    #[clap(long, default_value = "vm")]
    node_kind: NodeKind,

    /// Cloud credentials and resource-group configuration.
    #[clap(long, default_value = "/etc/kubernetes/cloud.json")]
    cloud_config: PathBuf,

    /// Client ids of identities that are never detached from nodes.
    #[clap(long, value_delimiter = ',')]
    immutable_client_ids: Vec<String>,

    /// Refuse instance-metadata requests instead of ignoring them.
    #[clap(long)]
    block_instance_metadata: bool,

    #[clap(long, default_value = "identity-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "pod-identity")]
    controller_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            reconcile_disabled,
            broker_disabled,
            broker_addr,
            sync_period_seconds,
            created_retry_attempts,
            assigned_retry_attempts,
            retry_interval_seconds,
            namespaced,
            node_kind,
            cloud_config,
            immutable_client_ids,
            block_instance_metadata,
            controller_deployment_name,
            controller_namespace,
        } = self;

        let mut prom = <Registry>::default();
        let reconcile_metrics =
            index::Metrics::register(prom.sub_registry_with_prefix("reconciler"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Build the index that maintains the reconciler's and broker's view
        // of the cluster, and spawn the watches that feed it.
        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_QUEUE_SIZE);
        let index = index::Index::shared(changes_tx);

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let identities = runtime.watch_all::<k8s::CloudIdentity>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), identities)
                .instrument(info_span!("cloudidentities")),
        );

        let bindings = runtime.watch_all::<k8s::IdentityBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), bindings)
                .instrument(info_span!("identitybindings")),
        );

        let assignments = runtime.watch_all::<k8s::AssignedIdentity>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), assignments)
                .instrument(info_span!("assignedidentities")),
        );

        if !reconcile_disabled {
            let arm = ArmConfig::load(&cloud_config).map(ArmClient::new)?;
            let cloud = Arc::new(CloudClient::new(arm, node_kind));
            let store = index::KubeStore::new(runtime.client());
            let params = index::PlanParams {
                namespaced,
                immutable_client_ids: immutable_client_ids
                    .iter()
                    .map(|id| id.to_lowercase())
                    .collect(),
            };
            let reconciler =
                index::Reconciler::new(index.clone(), store, cloud, params, reconcile_metrics);
            tokio::spawn(
                reconciler
                    .run(
                        Duration::from_secs(sync_period_seconds),
                        changes_rx,
                        claims.clone(),
                        hostname.clone(),
                    )
                    .instrument(info_span!("reconciler")),
            );
        }

        if !broker_disabled {
            let budget = RetryBudget {
                created_attempts: created_retry_attempts,
                assigned_attempts: assigned_retry_attempts,
                poll_interval: Duration::from_secs(retry_interval_seconds),
            };
            let resolver = Resolver::new(index::IndexLookup::new(index.clone()), budget, namespaced);
            let dispatcher = Dispatcher::new(
                StandardIssuer::default(),
                KubeSecrets::new(runtime.client()),
            );
            let broker = Arc::new(Broker::new(
                IndexWorkloads::new(index.clone()),
                resolver,
                dispatcher,
                block_instance_metadata,
                runtime.shutdown_handle(),
            ));
            tokio::spawn(
                async move {
                    if let Err(error) = broker.serve(broker_addr).await {
                        tracing::error!(%error, "token broker failed");
                    }
                }
                .instrument(info_span!("broker")),
            );
        }

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
