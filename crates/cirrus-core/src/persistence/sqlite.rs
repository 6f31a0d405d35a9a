// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::model::{
    Cluster, ClusterEvent, ClusterStatus, EngineInfo, JobExecution, JobStatus, ProvisionStep,
};

use super::Persistence;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: String,
    name: String,
    tenant_id: String,
    plugin_name: String,
    plugin_version: String,
    status: String,
    status_description: String,
    node_groups: String,
    rollback_info: String,
    engine_info: Option<String>,
    trust_id: Option<String>,
    extra: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ClusterRow {
    fn into_cluster(self, provision_progress: Vec<ProvisionStep>) -> Result<Cluster, CoreError> {
        let engine_info: Option<EngineInfo> = match self.engine_info {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Cluster {
            id: self.id,
            name: self.name,
            tenant_id: self.tenant_id,
            plugin_name: self.plugin_name,
            plugin_version: self.plugin_version,
            node_groups: serde_json::from_str(&self.node_groups)?,
            status: self.status.parse()?,
            status_description: self.status_description,
            rollback_info: serde_json::from_str(&self.rollback_info)?,
            engine_info,
            trust_id: self.trust_id,
            provision_progress,
            extra: serde_json::from_str(&self.extra)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    cluster_id: String,
    step_name: String,
    step_type: String,
    total: i64,
    completed: i64,
    successful: Option<bool>,
    created_at: DateTime<Utc>,
}

impl From<StepRow> for ProvisionStep {
    fn from(row: StepRow) -> Self {
        ProvisionStep {
            id: row.id,
            cluster_id: row.cluster_id,
            step_name: row.step_name,
            step_type: row.step_type,
            total: u32::try_from(row.total).unwrap_or(0),
            completed: u32::try_from(row.completed).unwrap_or(0),
            successful: row.successful,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    step_id: String,
    cluster_id: String,
    node_group_id: Option<String>,
    instance_id: Option<String>,
    instance_name: Option<String>,
    event_info: String,
    successful: bool,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for ClusterEvent {
    fn from(row: EventRow) -> Self {
        ClusterEvent {
            id: row.id,
            step_id: row.step_id,
            cluster_id: row.cluster_id,
            node_group_id: row.node_group_id,
            instance_id: row.instance_id,
            instance_name: row.instance_name,
            event_info: row.event_info,
            successful: row.successful,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    cluster_id: String,
    tenant_id: String,
    status: String,
    engine_job_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<JobExecution, CoreError> {
        Ok(JobExecution {
            id: self.id,
            cluster_id: self.cluster_id,
            tenant_id: self.tenant_id,
            status: self.status.parse()?,
            engine_job_id: self.engine_job_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const CLUSTER_COLUMNS: &str = "id, name, tenant_id, plugin_name, plugin_version, status, \
     status_description, node_groups, rollback_info, engine_info, trust_id, extra, \
     created_at, updated_at";

const STEP_COLUMNS: &str =
    "id, cluster_id, step_name, step_type, total, completed, successful, created_at";

const EVENT_COLUMNS: &str = "id, step_id, cluster_id, node_group_id, instance_id, \
     instance_name, event_info, successful, created_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// Migrations are not run; see [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file as needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_cluster_row(&self, cluster_id: &str) -> Result<Option<ClusterRow>, CoreError> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?"
        ))
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), CoreError> {
        let engine_info = cluster
            .engine_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO clusters (id, name, tenant_id, plugin_name, plugin_version, status,
                                  status_description, node_groups, rollback_info, engine_info,
                                  trust_id, extra, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster.id)
        .bind(&cluster.name)
        .bind(&cluster.tenant_id)
        .bind(&cluster.plugin_name)
        .bind(&cluster.plugin_version)
        .bind(cluster.status.as_str())
        .bind(&cluster.status_description)
        .bind(serde_json::to_string(&cluster.node_groups)?)
        .bind(serde_json::to_string(&cluster.rollback_info)?)
        .bind(engine_info)
        .bind(&cluster.trust_id)
        .bind(serde_json::to_string(&cluster.extra)?)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CoreError::AlreadyExists {
                    kind: "cluster",
                    id: cluster.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, CoreError> {
        let Some(row) = self.fetch_cluster_row(cluster_id).await? else {
            return Ok(None);
        };
        let steps = self.list_provision_steps(cluster_id).await?;
        row.into_cluster(steps).map(Some)
    }

    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, CoreError> {
        let rows = match tenant_id {
            Some(tenant_id) => {
                sqlx::query_as::<_, ClusterRow>(&format!(
                    "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE tenant_id = ? ORDER BY created_at"
                ))
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ClusterRow>(&format!(
                    "SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY created_at"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut clusters = Vec::with_capacity(rows.len());
        for row in rows {
            let steps = self.list_provision_steps(&row.id).await?;
            clusters.push(row.into_cluster(steps)?);
        }
        Ok(clusters)
    }

    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET status = ?, status_description = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(description)
        .bind(Utc::now())
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_cluster(cluster_id).await
    }

    async fn update_cluster_extra(
        &self,
        cluster_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE clusters SET extra = json_set(extra, ?, json(?)), updated_at = ? WHERE id = ?",
        )
        .bind(format!("$.\"{key}\""))
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now())
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_cluster_description(
        &self,
        cluster_id: &str,
        description: &str,
    ) -> Result<Option<Cluster>, CoreError> {
        let result = sqlx::query(
            "UPDATE clusters SET status_description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(description)
        .bind(Utc::now())
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_cluster(cluster_id).await
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<(), CoreError> {
        let engine_info = cluster
            .engine_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE clusters
            SET name = ?, node_groups = ?, rollback_info = ?, engine_info = ?,
                trust_id = ?, extra = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&cluster.name)
        .bind(serde_json::to_string(&cluster.node_groups)?)
        .bind(serde_json::to_string(&cluster.rollback_info)?)
        .bind(engine_info)
        .bind(&cluster.trust_id)
        .bind(serde_json::to_string(&cluster.extra)?)
        .bind(Utc::now())
        .bind(&cluster.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::cluster_not_found(&cluster.id));
        }
        Ok(())
    }

    async fn destroy_cluster(&self, cluster_id: &str) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["cluster_events", "provision_steps", "job_executions"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE cluster_id = ?"))
                .bind(cluster_id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_provision_step(&self, step: &ProvisionStep) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO provision_steps (id, cluster_id, step_name, step_type, total,
                                         completed, successful, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.id)
        .bind(&step.cluster_id)
        .bind(&step.step_name)
        .bind(&step.step_type)
        .bind(i64::from(step.total))
        .bind(i64::from(step.completed))
        .bind(step.successful)
        .bind(step.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_provision_step(
        &self,
        step_id: &str,
    ) -> Result<Option<ProvisionStep>, CoreError> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM provision_steps WHERE id = ?"
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_provision_steps(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ProvisionStep>, CoreError> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM provision_steps WHERE cluster_id = ? ORDER BY seq"
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_provision_step(
        &self,
        step_id: &str,
        completed: u32,
        successful: Option<bool>,
    ) -> Result<(), CoreError> {
        let result =
            sqlx::query("UPDATE provision_steps SET completed = ?, successful = ? WHERE id = ?")
                .bind(i64::from(completed))
                .bind(successful)
                .bind(step_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::StepNotFound {
                step_id: step_id.to_string(),
            });
        }
        Ok(())
    }

    async fn add_cluster_event(&self, event: &ClusterEvent) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO cluster_events (id, step_id, cluster_id, node_group_id, instance_id,
                                        instance_name, event_info, successful, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.step_id)
        .bind(&event.cluster_id)
        .bind(&event.node_group_id)
        .bind(&event.instance_id)
        .bind(&event.instance_name)
        .bind(&event.event_info)
        .bind(event.successful)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cluster_events(
        &self,
        cluster_id: &str,
        step_id: Option<&str>,
    ) -> Result<Vec<ClusterEvent>, CoreError> {
        let rows = match step_id {
            Some(step_id) => {
                sqlx::query_as::<_, EventRow>(&format!(
                    "SELECT {EVENT_COLUMNS} FROM cluster_events \
                     WHERE cluster_id = ? AND step_id = ? ORDER BY seq"
                ))
                .bind(cluster_id)
                .bind(step_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, EventRow>(&format!(
                    "SELECT {EVENT_COLUMNS} FROM cluster_events WHERE cluster_id = ? ORDER BY seq"
                ))
                .bind(cluster_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_cluster_progress(&self, cluster_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cluster_events WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM provision_steps WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_job_execution(&self, job: &JobExecution) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (id, cluster_id, tenant_id, status, engine_job_id,
                                        created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.cluster_id)
        .bind(&job.tenant_id)
        .bind(job.status.as_str())
        .bind(&job.engine_job_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job_execution(&self, job_id: &str) -> Result<Option<JobExecution>, CoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, cluster_id, tenant_id, status, engine_job_id, created_at, updated_at
            FROM job_executions
            WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_job_executions(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<JobExecution>, CoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, cluster_id, tenant_id, status, engine_job_id, created_at, updated_at
            FROM job_executions
            WHERE cluster_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        engine_job_id: Option<&str>,
    ) -> Result<Option<JobExecution>, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, engine_job_id = COALESCE(?, engine_job_id), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(engine_job_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job_execution(job_id).await
    }

    async fn delete_job_execution(&self, job_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM job_executions WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
