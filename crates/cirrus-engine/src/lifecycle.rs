// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster state machine.
//!
//! [`ClusterLifecycle`] drives a cluster through provisioning, scaling and
//! termination. Phases run strictly in order; each status change is persisted
//! (with an empty description) before the phase body runs.
//!
//! ```text
//! provision:  InfraUpdating → [engine: Spawning → Waiting → Preparing]
//!             → Configuring → Starting → Active
//! scale:      Decommissioning → Scaling → [Configuring] → Active
//! terminate:  (Deleting) → plugin shutdown → engine shutdown → row removed
//! ```
//!
//! Every operation runs inside [`ClusterLifecycle::guarded`]. On failure it
//! re-reads the cluster. A cluster that is gone or `Deleting` ends the
//! operation silently. Otherwise the infrastructure engine is asked to roll
//! back: success puts the cluster back to `Active`, anything else leaves it in
//! `Error`, with the failure recorded in the status description.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use cirrus_core::context::RequestContext;
use cirrus_core::infra::InfraEngine;
use cirrus_core::model::{Cluster, ClusterStatus, EngineInfo, Instance};
use cirrus_core::persistence::Persistence;
use cirrus_core::plugin::{PluginRegistry, ProvisioningPlugin};
use cirrus_core::progress::ProgressTracker;
use cirrus_core::remote::RemoteExecutor;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProvisioningError;
use crate::jobs::JobManager;
use crate::trusts::{NoTrusts, TrustManager, setup_trust};
use crate::verification::{
    DisabledVerifier, HealthVerifier, VerificationError, VerificationRequest,
};

pub const STEP_ENGINE_CREATE: &str = "Engine: create cluster";
pub const STEP_ENGINE_SCALE: &str = "Engine: scale cluster";
pub const STEP_ENGINE_SHUTDOWN: &str = "Engine: shutdown cluster";
pub const STEP_ENGINE_ROLLBACK: &str = "Engine: rollback cluster";
pub const STEP_PLUGIN_CONFIGURE: &str = "Plugin: configure cluster";
pub const STEP_PLUGIN_START: &str = "Plugin: start cluster";
pub const STEP_PLUGIN_SCALE: &str = "Plugin: scale cluster";
pub const STEP_PLUGIN_DECOMMISSION: &str = "Plugin: decommission cluster";
pub const STEP_PLUGIN_SHUTDOWN: &str = "Plugin: shutdown cluster";

/// Cluster operation run under [`ClusterLifecycle::guarded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Scale,
    Terminate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Scale => "scale",
            Self::Terminate => "terminate",
        }
    }

    /// Status description recorded when the operation fails.
    pub fn failure_description(&self, reason: &str) -> String {
        let verb = match self {
            Self::Create => "Creating",
            Self::Scale => "Scaling",
            Self::Terminate => "Terminating",
        };
        format!("{verb} cluster failed for the following reason(s): {reason}")
    }
}

/// Drives clusters through their lifecycle.
pub struct ClusterLifecycle {
    persistence: Arc<dyn Persistence>,
    plugins: PluginRegistry,
    infra: Arc<dyn InfraEngine>,
    remote: RemoteExecutor,
    progress: Arc<ProgressTracker>,
    trusts: Arc<dyn TrustManager>,
    verifier: Arc<dyn HealthVerifier>,
    jobs: Option<Arc<dyn JobManager>>,
}

impl ClusterLifecycle {
    /// Lifecycle without trusts, verifications or jobs.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        plugins: PluginRegistry,
        infra: Arc<dyn InfraEngine>,
        remote: RemoteExecutor,
    ) -> Self {
        Self {
            progress: Arc::new(ProgressTracker::new(persistence.clone())),
            persistence,
            plugins,
            infra,
            remote,
            trusts: Arc::new(NoTrusts),
            verifier: Arc::new(DisabledVerifier),
            jobs: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_trusts(mut self, trusts: Arc<dyn TrustManager>) -> Self {
        self.trusts = trusts;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn HealthVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobManager>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn infra(&self) -> &Arc<dyn InfraEngine> {
        &self.infra
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn jobs(&self) -> Option<&Arc<dyn JobManager>> {
        self.jobs.as_ref()
    }

    pub fn verifier(&self) -> &Arc<dyn HealthVerifier> {
        &self.verifier
    }

    /// Create infrastructure, configure and start a new cluster.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn provision(&self, ctx: &RequestContext, cluster_id: &str) {
        self.guarded(
            ctx,
            cluster_id,
            Operation::Create,
            self.provision_phases(ctx, cluster_id),
        )
        .await
    }

    /// Bring node groups to the counts in `node_group_counts`.
    #[instrument(skip(self, ctx, node_group_counts), fields(request_id = %ctx.request_id))]
    pub async fn provision_scaled(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_group_counts: &HashMap<String, u32>,
    ) {
        self.guarded(
            ctx,
            cluster_id,
            Operation::Scale,
            self.scale_phases(ctx, cluster_id, node_group_counts),
        )
        .await
    }

    /// Tear a cluster down and remove its record.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn terminate(&self, ctx: &RequestContext, cluster_id: &str) {
        self.guarded(
            ctx,
            cluster_id,
            Operation::Terminate,
            self.terminate_phases(ctx, cluster_id),
        )
        .await
    }

    /// Run `body` as `operation` on a cluster with the failure policy applied.
    ///
    /// The status description is cleared first. No error escapes: failures
    /// end up in the cluster's status and description.
    pub async fn guarded<Fut>(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        operation: Operation,
        body: Fut,
    ) where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        match self
            .persistence
            .update_cluster_description(cluster_id, "")
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(cluster_id = %cluster_id, operation = operation.as_str(), "Cluster does not exist, nothing to do");
                return;
            }
            Err(e) => {
                warn!(cluster_id = %cluster_id, error = %e, "Failed to clear status description");
            }
        }

        let Err(failure) = body.await else {
            return;
        };
        let reason = failure.to_string();

        let Some(cluster) = self.live_cluster(cluster_id).await else {
            return;
        };

        error!(
            cluster_id = %cluster_id,
            operation = operation.as_str(),
            reason = %reason,
            "Error during operating on cluster"
        );

        let outcome: anyhow::Result<()> = async {
            let description = operation.failure_description(&reason);
            let status = if self.rollback(ctx, &cluster, &reason).await? {
                ClusterStatus::Active
            } else {
                ClusterStatus::Error
            };
            self.set_status(cluster_id, status, &description).await?;
            Ok(())
        }
        .await;

        let Err(rollback_failure) = outcome else {
            return;
        };

        let Some(_) = self.live_cluster(cluster_id).await else {
            return;
        };
        error!(
            cluster_id = %cluster_id,
            reason = %rollback_failure,
            "Error during rollback of cluster"
        );
        let description = operation.failure_description(&format!("{reason}, {rollback_failure}"));
        if let Err(e) = self
            .set_status(cluster_id, ClusterStatus::Error, &description)
            .await
        {
            error!(cluster_id = %cluster_id, error = %e, "Failed to record cluster failure");
        }
    }

    /// The cluster unless it is gone or being deleted.
    async fn live_cluster(&self, cluster_id: &str) -> Option<Cluster> {
        match self.persistence.get_cluster(cluster_id).await {
            Ok(Some(cluster)) if cluster.status != ClusterStatus::Deleting => Some(cluster),
            Ok(_) => {
                debug!(
                    cluster_id = %cluster_id,
                    "Cluster was deleted or marked for deletion, canceling current operation"
                );
                None
            }
            Err(e) => {
                error!(cluster_id = %cluster_id, error = %e, "Failed to reload cluster after failure");
                None
            }
        }
    }

    async fn rollback(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        reason: &str,
    ) -> anyhow::Result<bool> {
        let ctx = setup_trust(
            self.trusts.as_ref(),
            self.persistence.as_ref(),
            ctx,
            &cluster.id,
        )
        .await?
        .with_step_type(STEP_ENGINE_ROLLBACK);
        Ok(self.infra.rollback_cluster(&ctx, cluster, reason).await?)
    }

    /// Persist a status unless the cluster is being deleted, which is final.
    ///
    /// Returns `None` if the cluster no longer exists.
    async fn set_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        description: &str,
    ) -> Result<Option<Cluster>, ProvisioningError> {
        let Some(current) = self.persistence.get_cluster(cluster_id).await? else {
            return Ok(None);
        };
        if current.status == ClusterStatus::Deleting {
            return Ok(Some(current));
        }
        let updated = self
            .persistence
            .update_cluster_status(cluster_id, status, description)
            .await?;
        if updated.is_some() {
            info!(cluster_id = %cluster_id, status = %status, "Cluster status changed");
        }
        Ok(updated)
    }

    /// Enter the next phase. Fails if the cluster vanished or is being
    /// deleted.
    async fn transition(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
    ) -> Result<Cluster, ProvisioningError> {
        match self.set_status(cluster_id, status, "").await? {
            Some(cluster) if cluster.status == status => Ok(cluster),
            Some(cluster) => Err(ProvisioningError::InvalidStatus {
                cluster_id: cluster_id.to_string(),
                operation: "updated",
                status: cluster.status,
            }),
            None => Err(ProvisioningError::ClusterVanished(cluster_id.to_string())),
        }
    }

    /// Record image users, set up the trust and return the context to run
    /// the operation under.
    async fn prepare(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> anyhow::Result<(RequestContext, Cluster, Arc<dyn ProvisioningPlugin>)> {
        let mut cluster = self.persistence.require_cluster(cluster_id).await?;
        let plugin = self.plugins.for_cluster(&cluster)?;

        for node_group in cluster.node_groups.iter_mut() {
            let username = self
                .infra
                .node_group_image_username(ctx, node_group)
                .await?;
            node_group.image_username = Some(username);
        }
        self.persistence.update_cluster(&cluster).await?;

        let ctx = setup_trust(
            self.trusts.as_ref(),
            self.persistence.as_ref(),
            ctx,
            cluster_id,
        )
        .await?;
        let cluster = self.persistence.require_cluster(cluster_id).await?;
        Ok((ctx, cluster, plugin))
    }

    async fn provision_phases(&self, ctx: &RequestContext, cluster_id: &str) -> anyhow::Result<()> {
        let (ctx, mut cluster, plugin) = self.prepare(ctx, cluster_id).await?;

        cluster.engine_info = Some(EngineInfo {
            infrastructure_engine: self.infra.type_and_version(),
            remote: self.remote.type_and_version(),
        });
        self.persistence.update_cluster(&cluster).await?;

        let cluster = self
            .transition(cluster_id, ClusterStatus::InfraUpdating)
            .await?;
        plugin.update_infra(&ctx, &cluster).await?;

        let cluster = self.persistence.require_cluster(cluster_id).await?;
        self.infra
            .create_cluster(&ctx.with_step_type(STEP_ENGINE_CREATE), &cluster)
            .await?;

        let cluster = self.transition(cluster_id, ClusterStatus::Configuring).await?;
        plugin
            .configure_cluster(&ctx.with_step_type(STEP_PLUGIN_CONFIGURE), &cluster)
            .await?;

        let cluster = self.transition(cluster_id, ClusterStatus::Starting).await?;
        plugin
            .start_cluster(&ctx.with_step_type(STEP_PLUGIN_START), &cluster)
            .await?;

        self.transition(cluster_id, ClusterStatus::Active).await?;
        info!(cluster_id = %cluster_id, "Cluster is active");

        self.run_pending_jobs(&ctx, cluster_id).await;
        self.refresh_health(&ctx, cluster_id).await;
        Ok(())
    }

    async fn scale_phases(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_group_counts: &HashMap<String, u32>,
    ) -> anyhow::Result<()> {
        let (ctx, _, plugin) = self.prepare(ctx, cluster_id).await?;

        let cluster = self
            .transition(cluster_id, ClusterStatus::Decommissioning)
            .await?;
        let to_delete = instances_to_delete(&cluster, node_group_counts);
        if !to_delete.is_empty() {
            info!(cluster_id = %cluster_id, count = to_delete.len(), "Decommissioning instances");
            plugin
                .decommission_nodes(
                    &ctx.with_step_type(STEP_PLUGIN_DECOMMISSION),
                    &cluster,
                    &to_delete,
                )
                .await?;
        }

        let cluster = self.transition(cluster_id, ClusterStatus::Scaling).await?;
        let new_ids = self
            .infra
            .scale_cluster(
                &ctx.with_step_type(STEP_ENGINE_SCALE),
                &cluster,
                node_group_counts,
            )
            .await?;

        if !new_ids.is_empty() {
            let cluster = self.transition(cluster_id, ClusterStatus::Configuring).await?;
            let wanted: HashSet<&str> = new_ids.iter().map(String::as_str).collect();
            let instances: Vec<Instance> = cluster
                .instances()
                .filter(|instance| wanted.contains(instance.id.as_str()))
                .cloned()
                .collect();
            plugin
                .scale_cluster(&ctx.with_step_type(STEP_PLUGIN_SCALE), &cluster, &instances)
                .await?;
        }

        self.transition(cluster_id, ClusterStatus::Active).await?;
        info!(cluster_id = %cluster_id, added = new_ids.len(), "Cluster scaled");

        self.refresh_health(&ctx, cluster_id).await;
        Ok(())
    }

    async fn terminate_phases(&self, ctx: &RequestContext, cluster_id: &str) -> anyhow::Result<()> {
        if self.persistence.get_cluster(cluster_id).await?.is_none() {
            return Ok(());
        }
        let ctx = setup_trust(
            self.trusts.as_ref(),
            self.persistence.as_ref(),
            ctx,
            cluster_id,
        )
        .await?;

        if let Some(jobs) = &self.jobs {
            jobs.update_job_statuses(&ctx, cluster_id).await?;
        }

        let Some(cluster) = self.persistence.get_cluster(cluster_id).await? else {
            return Ok(());
        };
        let plugin = self.plugins.for_cluster(&cluster)?;
        plugin
            .on_terminate_cluster(&ctx.with_step_type(STEP_PLUGIN_SHUTDOWN), &cluster)
            .await?;

        self.infra
            .shutdown_cluster(&ctx.with_step_type(STEP_ENGINE_SHUTDOWN), &cluster)
            .await?;

        self.trusts.delete_trust_for_cluster(&ctx, &cluster).await?;

        if let Err(e) = self.progress.clear_cluster(cluster_id).await {
            warn!(cluster_id = %cluster_id, error = %e, "Failed to clear provisioning progress");
        }
        self.persistence.destroy_cluster(cluster_id).await?;
        info!(cluster_id = %cluster_id, "Cluster terminated");
        Ok(())
    }

    async fn run_pending_jobs(&self, ctx: &RequestContext, cluster_id: &str) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        let pending = match self.persistence.pending_job_executions(cluster_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(cluster_id = %cluster_id, error = %e, "Failed to list pending job executions");
                return;
            }
        };
        for job in pending {
            if let Err(e) = jobs.run_job(ctx, &job.id).await {
                warn!(cluster_id = %cluster_id, job_id = %job.id, error = %e, "Failed to run pending job execution");
            }
        }
    }

    /// Start a health check. Never fails the operation.
    async fn refresh_health(&self, ctx: &RequestContext, cluster_id: &str) {
        let started = async {
            self.verifier.validate_start(ctx, cluster_id).await?;
            self.verifier
                .handle(ctx, cluster_id, &VerificationRequest::start())
                .await
        }
        .await;

        match started {
            Ok(()) => {}
            Err(VerificationError::CannotVerify(reason)) => {
                debug!(cluster_id = %cluster_id, reason = %reason, "Cannot verify cluster");
            }
            Err(e) => {
                debug!(cluster_id = %cluster_id, error = %e, "Skipping refreshing cluster health");
                if let Err(e) = self.verifier.clean(ctx, cluster_id).await {
                    debug!(cluster_id = %cluster_id, error = %e, "Failed to clean verification data");
                }
            }
        }
    }
}

/// Tail instances of node groups that shrink.
pub fn instances_to_delete(
    cluster: &Cluster,
    node_group_counts: &HashMap<String, u32>,
) -> Vec<Instance> {
    cluster
        .node_groups
        .iter()
        .flat_map(|node_group| {
            let target = node_group_counts
                .get(&node_group.id)
                .copied()
                .unwrap_or(node_group.count) as usize;
            let current = (node_group.count as usize).min(node_group.instances.len());
            let start = target.min(current);
            node_group.instances[start..current].iter().cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::model::NodeGroup;

    fn instance(ng: &NodeGroup, n: usize) -> Instance {
        Instance {
            id: format!("{}-{n}", ng.name),
            node_group_id: ng.id.clone(),
            instance_id: None,
            instance_name: format!("{}-{n}", ng.name),
            internal_ip: None,
            management_ip: None,
        }
    }

    #[test]
    fn test_failure_descriptions() {
        assert_eq!(
            Operation::Create.failure_description("boom"),
            "Creating cluster failed for the following reason(s): boom"
        );
        assert_eq!(
            Operation::Scale.failure_description("x"),
            "Scaling cluster failed for the following reason(s): x"
        );
        assert_eq!(
            Operation::Terminate.failure_description("y"),
            "Terminating cluster failed for the following reason(s): y"
        );
    }

    #[test]
    fn test_instances_to_delete_takes_tail_of_shrinking_groups() {
        let mut workers = NodeGroup::new("workers", "m1", 3);
        workers.instances = (0..3).map(|n| instance(&workers, n)).collect();
        let mut masters = NodeGroup::new("masters", "m1", 1);
        masters.instances = vec![instance(&masters, 0)];
        let cluster = Cluster::new("c", "t", "fake", "0.1", vec![workers.clone(), masters.clone()]);

        let counts = HashMap::from([(workers.id.clone(), 1), (masters.id.clone(), 2)]);
        let names: Vec<String> = instances_to_delete(&cluster, &counts)
            .into_iter()
            .map(|i| i.instance_name)
            .collect();

        assert_eq!(names, ["workers-1", "workers-2"]);
    }

    #[test]
    fn test_unlisted_groups_keep_their_instances() {
        let mut workers = NodeGroup::new("workers", "m1", 2);
        workers.instances = (0..2).map(|n| instance(&workers, n)).collect();
        let cluster = Cluster::new("c", "t", "fake", "0.1", vec![workers]);

        assert!(instances_to_delete(&cluster, &HashMap::new()).is_empty());
    }
}
