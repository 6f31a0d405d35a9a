// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence implementation.
//!
//! Used when the engine is embedded without a database, and by tests. Besides
//! the trait it records every status written per cluster, which
//! [`MemoryPersistence::status_history`] exposes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{
    Cluster, ClusterEvent, ClusterStatus, JobExecution, JobStatus, ProvisionStep,
};

use super::Persistence;

#[derive(Default)]
struct Store {
    clusters: HashMap<String, Cluster>,
    steps: Vec<ProvisionStep>,
    events: Vec<ClusterEvent>,
    jobs: HashMap<String, JobExecution>,
    status_history: HashMap<String, Vec<ClusterStatus>>,
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryPersistence {
    store: Mutex<Store>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every status written through `update_cluster_status`, in order.
    pub fn status_history(&self, cluster_id: &str) -> Vec<ClusterStatus> {
        self.store()
            .status_history
            .get(cluster_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), CoreError> {
        let mut store = self.store();
        if store.clusters.contains_key(&cluster.id) {
            return Err(CoreError::AlreadyExists {
                kind: "cluster",
                id: cluster.id.clone(),
            });
        }
        let mut stored = cluster.clone();
        stored.provision_progress.clear();
        store.clusters.insert(cluster.id.clone(), stored);
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, CoreError> {
        let store = self.store();
        Ok(store.clusters.get(cluster_id).map(|cluster| {
            let mut cluster = cluster.clone();
            cluster.provision_progress = store
                .steps
                .iter()
                .filter(|step| step.cluster_id == cluster_id)
                .cloned()
                .collect();
            cluster
        }))
    }

    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, CoreError> {
        let store = self.store();
        let mut clusters: Vec<Cluster> = store
            .clusters
            .values()
            .filter(|c| tenant_id.is_none_or(|t| c.tenant_id == t))
            .cloned()
            .collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError> {
        {
            let mut store = self.store();
            let Some(cluster) = store.clusters.get_mut(cluster_id) else {
                return Ok(None);
            };
            cluster.status = status;
            cluster.status_description = description.to_string();
            cluster.updated_at = Utc::now();
            store
                .status_history
                .entry(cluster_id.to_string())
                .or_default()
                .push(status);
        }
        self.get_cluster(cluster_id).await
    }

    async fn update_cluster_description(
        &self,
        cluster_id: &str,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError> {
        {
            let mut store = self.store();
            let Some(cluster) = store.clusters.get_mut(cluster_id) else {
                return Ok(None);
            };
            cluster.status_description = description.to_string();
            cluster.updated_at = Utc::now();
        }
        self.get_cluster(cluster_id).await
    }

    async fn update_cluster_extra(
        &self,
        cluster_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<bool, CoreError> {
        let mut store = self.store();
        let Some(cluster) = store.clusters.get_mut(cluster_id) else {
            return Ok(false);
        };
        cluster.extra.insert(key.to_string(), value.clone());
        cluster.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<(), CoreError> {
        let mut store = self.store();
        let stored = store
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| CoreError::cluster_not_found(&cluster.id))?;
        stored.name = cluster.name.clone();
        stored.node_groups = cluster.node_groups.clone();
        stored.rollback_info = cluster.rollback_info.clone();
        stored.engine_info = cluster.engine_info.clone();
        stored.trust_id = cluster.trust_id.clone();
        stored.extra = cluster.extra.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn destroy_cluster(&self, cluster_id: &str) -> Result<bool, CoreError> {
        let mut store = self.store();
        let existed = store.clusters.remove(cluster_id).is_some();
        store.steps.retain(|s| s.cluster_id != cluster_id);
        store.events.retain(|e| e.cluster_id != cluster_id);
        store.jobs.retain(|_, j| j.cluster_id != cluster_id);
        Ok(existed)
    }

    async fn add_provision_step(&self, step: &ProvisionStep) -> Result<(), CoreError> {
        let mut store = self.store();
        if !store.clusters.contains_key(&step.cluster_id) {
            return Err(CoreError::cluster_not_found(&step.cluster_id));
        }
        store.steps.push(step.clone());
        Ok(())
    }

    async fn get_provision_step(
        &self,
        step_id: &str,
    ) -> Result<Option<ProvisionStep>, CoreError> {
        Ok(self.store().steps.iter().find(|s| s.id == step_id).cloned())
    }

    async fn list_provision_steps(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ProvisionStep>, CoreError> {
        Ok(self
            .store()
            .steps
            .iter()
            .filter(|s| s.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn update_provision_step(
        &self,
        step_id: &str,
        completed: u32,
        successful: Option<bool>,
    ) -> Result<(), CoreError> {
        let mut store = self.store();
        let step = store
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| CoreError::StepNotFound {
                step_id: step_id.to_string(),
            })?;
        step.completed = completed;
        step.successful = successful;
        Ok(())
    }

    async fn add_cluster_event(&self, event: &ClusterEvent) -> Result<(), CoreError> {
        let mut store = self.store();
        if !store.steps.iter().any(|s| s.id == event.step_id) {
            return Err(CoreError::StepNotFound {
                step_id: event.step_id.clone(),
            });
        }
        store.events.push(event.clone());
        Ok(())
    }

    async fn list_cluster_events(
        &self,
        cluster_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ClusterEvent>, CoreError> {
        Ok(self
            .store()
            .events
            .iter()
            .filter(|e| e.cluster_id == cluster_id)
            .filter(|e| step_id.is_none_or(|id| e.step_id == id))
            .cloned()
            .collect())
    }

    async fn delete_cluster_progress(&self, cluster_id: &str) -> Result<(), CoreError> {
        let mut store = self.store();
        store.steps.retain(|s| s.cluster_id != cluster_id);
        store.events.retain(|e| e.cluster_id != cluster_id);
        Ok(())
    }

    async fn create_job_execution(&self, job: &JobExecution) -> Result<(), CoreError> {
        let mut store = self.store();
        if store.jobs.contains_key(&job.id) {
            return Err(CoreError::AlreadyExists {
                kind: "job execution",
                id: job.id.clone(),
            });
        }
        store.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job_execution(&self, job_id: &str) -> Result<Option<JobExecution>, CoreError> {
        Ok(self.store().jobs.get(job_id).cloned())
    }

    async fn list_job_executions(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<JobExecution>, CoreError> {
        let mut jobs: Vec<JobExecution> = self
            .store()
            .jobs
            .values()
            .filter(|j| j.cluster_id == cluster_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        engine_job_id: Option<&str>,
    ) -> Result<Option<JobExecution>, CoreError> {
        let mut store = self.store();
        let Some(job) = store.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        job.status = status;
        if let Some(engine_job_id) = engine_job_id {
            job.engine_job_id = Some(engine_job_id.to_string());
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn delete_job_execution(&self, job_id: &str) -> Result<bool, CoreError> {
        Ok(self.store().jobs.remove(job_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeGroup;

    fn cluster() -> Cluster {
        Cluster::new(
            "c1",
            "tenant",
            "fake",
            "0.1",
            vec![NodeGroup::new("workers", "small", 2)],
        )
    }

    #[tokio::test]
    async fn test_status_update_records_history() {
        let db = MemoryPersistence::new();
        let c = cluster();
        db.create_cluster(&c).await.unwrap();

        db.update_cluster_status(&c.id, ClusterStatus::InfraUpdating, "")
            .await
            .unwrap();
        let updated = db
            .update_cluster_status(&c.id, ClusterStatus::Error, "broken")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, ClusterStatus::Error);
        assert_eq!(updated.status_description, "broken");
        assert_eq!(
            db.status_history(&c.id),
            vec![ClusterStatus::InfraUpdating, ClusterStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_status_update_on_missing_cluster_returns_none() {
        let db = MemoryPersistence::new();
        let result = db
            .update_cluster_status("gone", ClusterStatus::Active, "")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(db.status_history("gone").is_empty());
    }

    #[tokio::test]
    async fn test_update_cluster_keeps_status() {
        let db = MemoryPersistence::new();
        let mut c = cluster();
        db.create_cluster(&c).await.unwrap();
        db.update_cluster_status(&c.id, ClusterStatus::Spawning, "")
            .await
            .unwrap();

        c.status = ClusterStatus::Error;
        c.node_groups[0].count = 5;
        db.update_cluster(&c).await.unwrap();

        let stored = db.require_cluster(&c.id).await.unwrap();
        assert_eq!(stored.status, ClusterStatus::Spawning);
        assert_eq!(stored.node_groups[0].count, 5);
    }

    #[tokio::test]
    async fn test_destroy_removes_progress_and_jobs() {
        let db = MemoryPersistence::new();
        let c = cluster();
        db.create_cluster(&c).await.unwrap();
        db.create_job_execution(&JobExecution::new(&c.id, "tenant"))
            .await
            .unwrap();

        assert!(db.destroy_cluster(&c.id).await.unwrap());
        assert!(!db.destroy_cluster(&c.id).await.unwrap());
        assert!(db.list_job_executions(&c.id).await.unwrap().is_empty());
        assert!(db.require_cluster(&c.id).await.unwrap_err().is_not_found());
    }
}
