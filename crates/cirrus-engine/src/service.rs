// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster service.
//!
//! Synchronous entry points. Each request is validated (layout, plugin,
//! quotas, status) before anything is scheduled; validation failures are
//! returned to the caller. Accepted work is handed to the [`Ops`] dispatcher
//! and the call returns with the cluster as stored at that point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cirrus_core::context::RequestContext;
use cirrus_core::error::CoreError;
use cirrus_core::model::{Cluster, ClusterStatus, JobExecution, NodeGroup};
use cirrus_core::persistence::Persistence;
use cirrus_core::plugin::{PluginRegistry, ProvisioningPlugin};
use cirrus_core::quotas::QuotaChecker;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::dispatcher::Ops;
use crate::error::{ProvisioningError, Result};
use crate::jobs::JobError;
use crate::verification::{DisabledVerifier, HealthVerifier, VerificationRequest};

/// Node group part of a create or scale request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupRequest {
    pub name: String,
    pub flavor_id: String,
    pub count: u32,
    #[serde(default)]
    pub node_processes: Vec<String>,
    #[serde(default)]
    pub image_username: Option<String>,
    #[serde(default)]
    pub floating_ip_pool: Option<String>,
    #[serde(default)]
    pub volumes_per_node: u32,
    #[serde(default)]
    pub volumes_size: u32,
    #[serde(default)]
    pub auto_security_group: bool,
}

impl NodeGroupRequest {
    pub fn new(name: impl Into<String>, flavor_id: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            flavor_id: flavor_id.into(),
            count,
            node_processes: Vec::new(),
            image_username: None,
            floating_ip_pool: None,
            volumes_per_node: 0,
            volumes_size: 0,
            auto_security_group: false,
        }
    }

    pub fn with_processes<I, S>(mut self, processes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_processes = processes.into_iter().map(Into::into).collect();
        self
    }

    fn into_node_group(self, count: u32, plugin: &dyn ProvisioningPlugin) -> NodeGroup {
        let mut node_group = NodeGroup::new(self.name, self.flavor_id, count);
        node_group.node_processes = self.node_processes;
        node_group.image_username = self.image_username;
        node_group.floating_ip_pool = self.floating_ip_pool;
        node_group.volumes_per_node = self.volumes_per_node;
        node_group.volumes_size = self.volumes_size;
        node_group.auto_security_group = self.auto_security_group;
        if node_group.auto_security_group {
            node_group.open_ports = plugin.get_open_ports(&node_group);
        }
        node_group
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub node_groups: Vec<NodeGroupRequest>,
}

/// New count for an existing node group, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeNodeGroup {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleClusterRequest {
    #[serde(default)]
    pub resize_node_groups: Vec<ResizeNodeGroup>,
    #[serde(default)]
    pub add_node_groups: Vec<NodeGroupRequest>,
}

/// Validates requests and schedules cluster and job operations.
pub struct ClusterService {
    persistence: Arc<dyn Persistence>,
    plugins: PluginRegistry,
    quotas: QuotaChecker,
    ops: Arc<dyn Ops>,
    verifier: Arc<dyn HealthVerifier>,
}

impl ClusterService {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        plugins: PluginRegistry,
        quotas: QuotaChecker,
        ops: Arc<dyn Ops>,
    ) -> Self {
        Self {
            persistence,
            plugins,
            quotas,
            ops,
            verifier: Arc::new(DisabledVerifier),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn HealthVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub async fn get_cluster(&self, _ctx: &RequestContext, cluster_id: &str) -> Result<Cluster> {
        Ok(self.persistence.require_cluster(cluster_id).await?)
    }

    /// Clusters of the caller's tenant; admins see all.
    pub async fn list_clusters(&self, ctx: &RequestContext) -> Result<Vec<Cluster>> {
        let tenant = (!ctx.is_admin).then(|| ctx.tenant());
        Ok(self.persistence.list_clusters(tenant).await?)
    }

    /// Store a new cluster, validate it and schedule provisioning.
    ///
    /// A cluster that fails validation is kept in `Error` status with the
    /// failure as its description.
    #[instrument(skip(self, ctx, request), fields(request_id = %ctx.request_id, name = %request.name))]
    pub async fn create_cluster(
        &self,
        ctx: &RequestContext,
        request: CreateClusterRequest,
    ) -> Result<Cluster> {
        if request.name.trim().is_empty() {
            return Err(ProvisioningError::InvalidRequest(
                "cluster name must not be empty".to_string(),
            ));
        }
        unique_names(request.node_groups.iter().map(|ng| ng.name.as_str()))?;

        let plugin = self
            .plugins
            .resolve(&request.plugin_name, &request.plugin_version)?;
        let node_groups = request
            .node_groups
            .into_iter()
            .map(|ng| {
                let count = ng.count;
                ng.into_node_group(count, plugin.as_ref())
            })
            .collect();
        let cluster = Cluster::new(
            request.name,
            ctx.tenant(),
            request.plugin_name,
            request.plugin_version,
            node_groups,
        );
        self.persistence.create_cluster(&cluster).await?;

        let validated: Result<()> = async {
            self.quotas.check(ctx, &cluster).await?;
            plugin.validate(ctx, &cluster).await?;
            Ok(())
        }
        .await;
        if let Err(e) = validated {
            warn!(cluster_id = %cluster.id, error = %e, "Cluster validation failed");
            self.persistence
                .update_cluster_status(&cluster.id, ClusterStatus::Error, &e.to_string())
                .await?;
            return Err(e);
        }

        self.ops.provision_cluster(ctx, &cluster.id).await?;
        info!(cluster_id = %cluster.id, "Cluster provisioning scheduled");
        Ok(self.persistence.require_cluster(&cluster.id).await?)
    }

    /// Validate a scaling request and schedule it.
    ///
    /// Added node groups are stored with count 0 and grow during scaling. If
    /// validation fails they are removed again and the cluster returns to
    /// `Active` with the failure as its description.
    #[instrument(skip(self, ctx, request), fields(request_id = %ctx.request_id))]
    pub async fn scale_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: ScaleClusterRequest,
    ) -> Result<Cluster> {
        let mut cluster = self.persistence.require_cluster(cluster_id).await?;
        if cluster.status != ClusterStatus::Active {
            return Err(ProvisioningError::InvalidStatus {
                cluster_id: cluster_id.to_string(),
                operation: "scaled",
                status: cluster.status,
            });
        }

        let current = self.ops.get_engine_type_and_version(ctx).await?;
        if let Some(engine_info) = &cluster.engine_info {
            if engine_info.infrastructure_engine != current {
                return Err(ProvisioningError::IncompatibleEngine {
                    created: engine_info.infrastructure_engine.clone(),
                    current,
                });
            }
        }

        if request.resize_node_groups.is_empty() && request.add_node_groups.is_empty() {
            return Err(ProvisioningError::InvalidRequest(
                "nothing to scale".to_string(),
            ));
        }
        unique_names(request.resize_node_groups.iter().map(|r| r.name.as_str()))?;
        unique_names(
            cluster
                .node_groups
                .iter()
                .map(|ng| ng.name.as_str())
                .chain(request.add_node_groups.iter().map(|ng| ng.name.as_str())),
        )?;

        let plugin = self.plugins.for_cluster(&cluster)?;

        let mut to_be_enlarged = HashMap::new();
        for resize in &request.resize_node_groups {
            let node_group = cluster
                .node_groups
                .iter()
                .find(|ng| ng.name == resize.name)
                .ok_or_else(|| {
                    ProvisioningError::InvalidRequest(format!(
                        "node group '{}' does not exist",
                        resize.name
                    ))
                })?;
            to_be_enlarged.insert(node_group.id.clone(), resize.count);
        }

        let mut additional = HashMap::new();
        for ng in request.add_node_groups {
            let count = ng.count;
            let node_group = ng.into_node_group(0, plugin.as_ref());
            additional.insert(node_group.id.clone(), count);
            cluster.node_groups.push(node_group);
        }
        if !additional.is_empty() {
            self.persistence.update_cluster(&cluster).await?;
        }

        let cluster = self
            .persistence
            .update_cluster_status(cluster_id, ClusterStatus::Validating, "")
            .await?
            .ok_or_else(|| CoreError::cluster_not_found(cluster_id))?;

        let validated: Result<()> = async {
            self.quotas
                .check_scaling(ctx, &cluster, &to_be_enlarged, &additional)
                .await?;
            plugin
                .validate_scaling(ctx, &cluster, &to_be_enlarged, &additional)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = validated {
            warn!(cluster_id = %cluster_id, error = %e, "Scaling validation failed");
            self.revert_scaling(cluster_id, &additional, &e.to_string())
                .await?;
            return Err(e);
        }

        let mut node_group_counts = to_be_enlarged;
        node_group_counts.extend(additional);
        self.ops
            .provision_scaled_cluster(ctx, cluster_id, node_group_counts)
            .await?;
        info!(cluster_id = %cluster_id, "Cluster scaling scheduled");
        Ok(self.persistence.require_cluster(cluster_id).await?)
    }

    async fn revert_scaling(
        &self,
        cluster_id: &str,
        added: &HashMap<String, u32>,
        description: &str,
    ) -> Result<()> {
        if let Some(mut cluster) = self.persistence.get_cluster(cluster_id).await? {
            let before = cluster.node_groups.len();
            cluster
                .node_groups
                .retain(|ng| !(added.contains_key(&ng.id) && ng.count == 0));
            if cluster.node_groups.len() != before {
                self.persistence.update_cluster(&cluster).await?;
            }
        }
        self.persistence
            .update_cluster_status(cluster_id, ClusterStatus::Active, description)
            .await?;
        Ok(())
    }

    /// Mark the cluster `Deleting` and schedule its termination.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete_cluster(&self, ctx: &RequestContext, cluster_id: &str) -> Result<()> {
        self.persistence
            .update_cluster_status(cluster_id, ClusterStatus::Deleting, "")
            .await?
            .ok_or_else(|| CoreError::cluster_not_found(cluster_id))?;
        self.ops.terminate_cluster(ctx, cluster_id).await?;
        info!(cluster_id = %cluster_id, "Cluster termination scheduled");
        Ok(())
    }

    /// Start a health verification of an active cluster.
    pub async fn verify_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: VerificationRequest,
    ) -> Result<()> {
        self.verifier.validate_start(ctx, cluster_id).await?;
        self.ops
            .handle_verification(ctx, cluster_id, request)
            .await?;
        Ok(())
    }

    /// Record a job execution and schedule it. It starts once the cluster is
    /// active.
    pub async fn submit_job(&self, ctx: &RequestContext, cluster_id: &str) -> Result<JobExecution> {
        let cluster = self.persistence.require_cluster(cluster_id).await?;
        if matches!(
            cluster.status,
            ClusterStatus::Deleting | ClusterStatus::Error
        ) {
            return Err(ProvisioningError::InvalidStatus {
                cluster_id: cluster_id.to_string(),
                operation: "used for jobs",
                status: cluster.status,
            });
        }

        let job = JobExecution::new(cluster_id, cluster.tenant_id.clone());
        self.persistence.create_job_execution(&job).await?;
        self.ops.run_job(ctx, &job.id).await?;
        info!(cluster_id = %cluster_id, job_id = %job.id, "Job execution submitted");
        Ok(job)
    }

    pub async fn get_job(&self, _ctx: &RequestContext, job_id: &str) -> Result<JobExecution> {
        self.require_job(job_id).await
    }

    pub async fn list_jobs(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<Vec<JobExecution>> {
        Ok(self.persistence.list_job_executions(cluster_id).await?)
    }

    pub async fn cancel_job(&self, ctx: &RequestContext, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        if job.status.is_terminated() {
            return Err(JobError::InvalidStatus {
                job_id: job_id.to_string(),
                operation: "canceled",
                status: job.status,
            }
            .into());
        }
        self.ops.cancel_job(ctx, job_id).await?;
        Ok(())
    }

    pub async fn suspend_job(&self, ctx: &RequestContext, job_id: &str) -> Result<()> {
        self.require_job(job_id).await?;
        self.ops.suspend_job(ctx, job_id).await?;
        Ok(())
    }

    /// Schedule removal. A running job is canceled first.
    pub async fn delete_job(&self, ctx: &RequestContext, job_id: &str) -> Result<()> {
        self.require_job(job_id).await?;
        self.ops.delete_job(ctx, job_id).await?;
        Ok(())
    }

    async fn require_job(&self, job_id: &str) -> Result<JobExecution> {
        self.persistence
            .get_job_execution(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()).into())
    }
}

fn unique_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ProvisioningError::InvalidRequest(format!(
                "duplicate node group name '{name}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(unique_names(["master", "worker"]).is_ok());
        let err = unique_names(["worker", "master", "worker"]).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
        assert!(err.to_string().contains("'worker'"));
    }

    #[test]
    fn test_scale_request_defaults() {
        let request: ScaleClusterRequest =
            serde_json::from_str(r#"{"resize_node_groups":[{"name":"worker","count":4}]}"#)
                .unwrap();
        assert_eq!(request.resize_node_groups[0].count, 4);
        assert!(request.add_node_groups.is_empty());
    }
}
