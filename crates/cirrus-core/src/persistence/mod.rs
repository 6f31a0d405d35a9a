// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for cirrus-core.
//!
//! This module defines the storage abstraction the lifecycle code talks to
//! and two implementations of it:
//! - [`MemoryPersistence`] keeps everything in process memory.
//! - [`SqlitePersistence`] stores records in SQLite through `sqlx`.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{
    Cluster, ClusterEvent, ClusterStatus, JobExecution, JobStatus, ProvisionStep,
};

/// Storage used by the control plane.
///
/// Cluster status only changes through [`update_cluster_status`], which is a
/// single atomic write. [`update_cluster`] writes every other cluster field.
///
/// [`update_cluster_status`]: Persistence::update_cluster_status
/// [`update_cluster`]: Persistence::update_cluster
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), CoreError>;

    /// Fetch a cluster with its provision steps, oldest step first.
    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, CoreError>;

    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, CoreError>;

    /// Set status and description in one write.
    ///
    /// Returns the updated cluster, or `None` if the cluster no longer exists.
    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError>;

    /// Replace the status description, leaving the status as is.
    ///
    /// Returns `None` if the cluster no longer exists.
    async fn update_cluster_description(
        &self,
        cluster_id: &str,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError>;

    /// Persist topology, engine info, rollback info, trust and extra fields.
    ///
    /// Status, status description and provision progress are left untouched.
    async fn update_cluster(&self, cluster: &Cluster) -> Result<(), CoreError>;

    /// Set one key of the cluster's `extra` map, leaving every other field
    /// as stored. Returns false if the cluster is gone.
    async fn update_cluster_extra(
        &self,
        cluster_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<bool, CoreError>;

    /// Remove the cluster row. Returns false if it was already gone.
    async fn destroy_cluster(&self, cluster_id: &str) -> Result<bool, CoreError>;

    async fn add_provision_step(&self, step: &ProvisionStep) -> Result<(), CoreError>;

    async fn get_provision_step(&self, step_id: &str)
    -> Result<Option<ProvisionStep>, CoreError>;

    /// Steps of a cluster in creation order.
    async fn list_provision_steps(&self, cluster_id: &str)
    -> Result<Vec<ProvisionStep>, CoreError>;

    async fn update_provision_step(
        &self,
        step_id: &str,
        completed: u32,
        successful: Option<bool>,
    ) -> Result<(), CoreError>;

    async fn add_cluster_event(&self, event: &ClusterEvent) -> Result<(), CoreError>;

    /// Events in insertion order, for a whole cluster or one step.
    async fn list_cluster_events(
        &self,
        cluster_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ClusterEvent>, CoreError>;

    /// Drop every step and event of a cluster.
    async fn delete_cluster_progress(&self, cluster_id: &str) -> Result<(), CoreError>;

    async fn create_job_execution(&self, job: &JobExecution) -> Result<(), CoreError>;

    async fn get_job_execution(&self, job_id: &str) -> Result<Option<JobExecution>, CoreError>;

    async fn list_job_executions(&self, cluster_id: &str)
    -> Result<Vec<JobExecution>, CoreError>;

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        engine_job_id: Option<&str>,
    ) -> Result<Option<JobExecution>, CoreError>;

    async fn delete_job_execution(&self, job_id: &str) -> Result<bool, CoreError>;

    /// Fetch a cluster or fail with [`CoreError::ClusterNotFound`].
    async fn require_cluster(&self, cluster_id: &str) -> Result<Cluster, CoreError> {
        self.get_cluster(cluster_id)
            .await?
            .ok_or_else(|| CoreError::cluster_not_found(cluster_id))
    }

    /// Pending jobs of a cluster.
    async fn pending_job_executions(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<JobExecution>, CoreError> {
        Ok(self
            .list_job_executions(cluster_id)
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .collect())
    }
}
