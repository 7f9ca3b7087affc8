//! Drives reconciliation cycles: plans against a snapshot, then applies
//! record and node updates, isolating each node's failures.

use crate::{
    index::SharedIndex,
    metrics::Metrics,
    plan::{plan, NodeOps, PlanParams},
    store::AssignmentStore,
};
use identity_controller_cloud::{CloudClient, NodeTarget, ScaleSetApi, VirtualMachineApi};
use identity_controller_k8s_api::AssignmentPhase;
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time,
};

pub struct Reconciler<C, S> {
    index: SharedIndex,
    store: S,
    cloud: Arc<CloudClient<C>>,
    params: PlanParams,
    metrics: Metrics,
}

impl<C, S> Reconciler<C, S>
where
    C: VirtualMachineApi + ScaleSetApi,
    S: AssignmentStore,
{
    pub fn new(
        index: SharedIndex,
        store: S,
        cloud: Arc<CloudClient<C>>,
        params: PlanParams,
        metrics: Metrics,
    ) -> Self {
        Self {
            index,
            store,
            cloud,
            params,
            metrics,
        }
    }

    /// Runs cycles on a timer and on change nudges until the nudge channel
    /// closes. Only the current lease holder applies changes; standby
    /// replicas keep their indexes warm and wait.
    pub async fn run(
        self,
        period: time::Duration,
        mut changes: mpsc::Receiver<()>,
        claims: watch::Receiver<Arc<Claim>>,
        claimant: String,
    ) {
        let mut ticks = time::interval(period);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                change = changes.recv() => {
                    if change.is_none() {
                        tracing::debug!("change channel closed; stopping reconciliation");
                        return;
                    }
                    // Collapse any nudges that raced in behind this one;
                    // the cycle reads fresh state anyway.
                    while changes.try_recv().is_ok() {}
                }
            }

            if !claims.borrow().is_current_for(&claimant) {
                tracing::trace!("not the current lease holder; skipping cycle");
                continue;
            }

            if let Err(error) = self.cycle().await {
                self.metrics.cycle_failures.inc();
                tracing::error!(%error, "reconciliation cycle failed");
            }
        }
    }

    /// Executes one reconciliation cycle. Safe to re-invoke at any point:
    /// creates and deletes are idempotent and interrupted work is redone
    /// by the next cycle.
    pub async fn cycle(&self) -> anyhow::Result<()> {
        let current = self.store.list().await?;
        let snapshot = self.index.read().snapshot();
        let plan = plan(&snapshot, &current, &self.params, |node| {
            self.cloud.target_for(node)
        });
        if plan.is_empty() {
            tracing::trace!("nothing to reconcile");
            return Ok(());
        }

        self.metrics.cycles.inc();
        let nodes = plan.nodes.len();
        let results = futures::future::join_all(
            plan.nodes
                .into_iter()
                .map(|(target, ops)| self.sync_node(target, ops)),
        )
        .await;

        let failed = results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            self.metrics.cycle_failures.inc();
            tracing::warn!(nodes, failed, "cycle completed with node update failures");
        } else {
            tracing::info!(nodes, "cycle completed");
        }
        Ok(())
    }

    /// Applies one node's work: record creation, a single cloud write, and
    /// the post-confirmation record updates. Returns whether the node
    /// converged.
    async fn sync_node(&self, target: NodeTarget, ops: NodeOps) -> bool {
        let NodeOps {
            additions,
            removals,
            create,
            advance,
            delete,
        } = ops;
        tracing::debug!(
            node = %target,
            create = create.len(),
            advance = advance.len(),
            delete = delete.len(),
            "processing node"
        );

        // Records are created ahead of the cloud write so a workload's
        // token request can already observe them in `Created`.
        let mut to_advance = advance;
        for record in create {
            match self.store.create(&record).await {
                Ok(()) => {
                    self.metrics.records_created.inc();
                    to_advance.push(record);
                }
                Err(error) => {
                    tracing::error!(
                        assignment = record.metadata.name.as_deref().unwrap_or_default(),
                        %error,
                        "failed to create assignment record"
                    );
                }
            }
        }

        // Service-principal assignments occupy no slot on the node, so a
        // target with no attach/detach work needs no cloud call at all.
        let updated = if additions.is_empty() && removals.is_empty() {
            Ok(false)
        } else {
            self.cloud
                .update_attached_identities(&target, &additions, &removals)
                .await
        };

        match updated {
            Ok(changed) => {
                if changed {
                    self.metrics.cloud_writes.inc();
                }

                // Only a confirmed node write may move records to
                // `Assigned`.
                for record in to_advance {
                    if let Err(error) =
                        self.store.set_phase(&record, AssignmentPhase::Assigned).await
                    {
                        tracing::error!(
                            assignment = record.metadata.name.as_deref().unwrap_or_default(),
                            %error,
                            "failed to advance assignment record"
                        );
                    }
                }

                // Deletion order matters: the record outlives the attached
                // identity, never the other way around.
                for record in delete {
                    match self.store.delete(&record).await {
                        Ok(()) => {
                            self.metrics.records_deleted.inc();
                        }
                        Err(error) => {
                            tracing::error!(
                                assignment = record.metadata.name.as_deref().unwrap_or_default(),
                                %error,
                                "failed to delete assignment record"
                            );
                        }
                    }
                }
                true
            }
            Err(error) => {
                // Creations stay in `Created` and deletions keep their
                // records; the next cycle retries.
                tracing::warn!(node = %target, %error, "node identity update failed; will retry");
                false
            }
        }
    }
}
