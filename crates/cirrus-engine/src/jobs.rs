// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job executions on provisioned clusters.
//!
//! A [`JobEngine`] talks to whatever runs jobs on a cluster (Oozie, Spark
//! submit, ...). [`JobCoordinator`] keeps job execution records in step with
//! it and implements [`JobManager`], the interface the lifecycle and the ops
//! dispatcher use.
//!
//! Cancellation is a best-effort signal. The coordinator marks the job
//! `TOBEKILLED`, asks the engine to kill it and polls until the job reaches an
//! end state or `canceling_timeout` passes, in which case
//! [`JobError::CancelingFailed`] is returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use cirrus_core::error::CoreError;
use cirrus_core::model::{Cluster, ClusterStatus, JobExecution, JobStatus};
use cirrus_core::persistence::Persistence;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default bound on waiting for a job to be killed.
pub const DEFAULT_CANCELING_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause between cancel attempts.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Errors raised while handling job executions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    #[error("Job execution '{0}' not found")]
    NotFound(String),

    /// The job did not reach an end state in time.
    #[error("Job execution {job_id} could not be canceled within {timeout:?}")]
    CancelingFailed { job_id: String, timeout: Duration },

    #[error("Job execution {job_id} cannot be {operation} in {status} status")]
    InvalidStatus {
        job_id: String,
        operation: &'static str,
        status: JobStatus,
    },

    /// The job engine reported a failure.
    #[error("Job engine error: {0}")]
    Engine(#[from] anyhow::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Connection to the service that actually runs jobs.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Submit a job. Returns the engine's id for it and its initial status.
    async fn run_job(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        job: &JobExecution,
    ) -> anyhow::Result<(String, JobStatus)>;

    /// Current status, or `None` if the engine does not know the job.
    async fn get_job_status(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        job: &JobExecution,
    ) -> anyhow::Result<Option<JobStatus>>;

    /// Ask the engine to kill the job. `Some(status)` once it is gone.
    async fn cancel_job(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        job: &JobExecution,
    ) -> anyhow::Result<Option<JobStatus>>;

    /// Ask the engine to suspend the job.
    async fn suspend_job(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _job: &JobExecution,
    ) -> anyhow::Result<Option<JobStatus>> {
        anyhow::bail!("job engine does not support suspending jobs")
    }
}

/// Job operations used by the lifecycle and the ops dispatcher.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Launch a pending job if its cluster is active.
    async fn run_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), JobError>;

    /// Kill a job and wait for it to end. `Ok(None)` if the record is gone.
    async fn cancel_job(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<Option<JobExecution>, JobError>;

    async fn suspend_job(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<Option<JobExecution>, JobError>;

    /// Refresh the status of every unfinished job on a cluster.
    async fn update_job_statuses(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), JobError>;
}

/// [`JobManager`] over a [`JobEngine`] and job execution records.
pub struct JobCoordinator {
    persistence: Arc<dyn Persistence>,
    engine: Arc<dyn JobEngine>,
    canceling_timeout: Duration,
    poll_interval: Duration,
}

impl JobCoordinator {
    pub fn new(persistence: Arc<dyn Persistence>, engine: Arc<dyn JobEngine>) -> Self {
        Self {
            persistence,
            engine,
            canceling_timeout: DEFAULT_CANCELING_TIMEOUT,
            poll_interval: CANCEL_POLL_INTERVAL,
        }
    }

    pub fn with_canceling_timeout(mut self, timeout: Duration) -> Self {
        self.canceling_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn require_job(&self, job_id: &str) -> Result<JobExecution, JobError> {
        self.persistence
            .get_job_execution(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    async fn write_status(
        &self,
        job: &JobExecution,
        status: JobStatus,
    ) -> Result<Option<JobExecution>, JobError> {
        Ok(self
            .persistence
            .update_job_status(&job.id, status, None)
            .await?)
    }
}

#[async_trait]
impl JobManager for JobCoordinator {
    #[instrument(skip(self, ctx))]
    async fn run_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), JobError> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Pending {
            debug!(status = %job.status, "Job execution is not pending, nothing to run");
            return Ok(());
        }

        let Some(cluster) = self.persistence.get_cluster(&job.cluster_id).await? else {
            info!(cluster_id = %job.cluster_id, "Cluster is gone, job execution stays pending");
            return Ok(());
        };
        if cluster.status != ClusterStatus::Active {
            info!(
                cluster_id = %cluster.id,
                status = %cluster.status,
                "Job execution will run once the cluster is active"
            );
            return Ok(());
        }

        match self.engine.run_job(ctx, &cluster, &job).await {
            Ok((engine_job_id, status)) => {
                self.persistence
                    .update_job_status(job_id, status, Some(&engine_job_id))
                    .await?;
                info!(engine_job_id = %engine_job_id, status = %status, "Job execution started");
                Ok(())
            }
            Err(e) => {
                self.write_status(&job, JobStatus::Failed).await?;
                Err(JobError::Engine(e))
            }
        }
    }

    #[instrument(skip(self, ctx))]
    async fn cancel_job(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<Option<JobExecution>, JobError> {
        let Some(mut job) = self.persistence.get_job_execution(job_id).await? else {
            return Ok(None);
        };
        if job.status.is_terminated() {
            info!(status = %job.status, "Job execution is already finished and shouldn't be canceled");
            return Ok(Some(job));
        }
        let Some(cluster) = self.persistence.get_cluster(&job.cluster_id).await? else {
            info!("Can not cancel a job execution on a cluster that no longer exists");
            return Ok(Some(job));
        };

        if let Some(updated) = self.write_status(&job, JobStatus::ToBeKilled).await? {
            job = updated;
        }

        let started = Instant::now();
        while started.elapsed() < self.canceling_timeout {
            if job.status.is_terminated() {
                info!(status = %job.status, "Job execution ended while canceling");
                return Ok(Some(job));
            }

            match self.engine.cancel_job(ctx, &cluster, &job).await {
                Ok(Some(status)) => {
                    let updated = self.write_status(&job, status).await?;
                    info!(status = %status, "Job execution was canceled successfully");
                    return Ok(updated);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Error during cancel of job execution"),
            }

            tokio::time::sleep(self.poll_interval).await;

            match self.persistence.get_job_execution(job_id).await? {
                Some(current) => job = current,
                None => {
                    info!("Job execution was deleted, canceling current operation");
                    return Ok(None);
                }
            }
        }

        Err(JobError::CancelingFailed {
            job_id: job_id.to_string(),
            timeout: self.canceling_timeout,
        })
    }

    #[instrument(skip(self, ctx))]
    async fn suspend_job(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<Option<JobExecution>, JobError> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(JobError::InvalidStatus {
                job_id: job_id.to_string(),
                operation: "suspended",
                status: job.status,
            });
        }
        let cluster = self.persistence.require_cluster(&job.cluster_id).await?;

        match self.engine.suspend_job(ctx, &cluster, &job).await? {
            Some(status) => self.write_status(&job, status).await,
            None => Ok(Some(job)),
        }
    }

    #[instrument(skip(self, ctx))]
    async fn update_job_statuses(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), JobError> {
        let Some(cluster) = self.persistence.get_cluster(cluster_id).await? else {
            return Ok(());
        };
        let jobs = self.persistence.list_job_executions(cluster_id).await?;

        for job in jobs
            .iter()
            .filter(|job| !job.status.is_terminated() && job.engine_job_id.is_some())
        {
            match self.engine.get_job_status(ctx, &cluster, job).await {
                Ok(Some(status)) if status != job.status => {
                    self.write_status(job, status).await?;
                    debug!(job_id = %job.id, status = %status, "Job status updated");
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Error during update of job status"),
            }
        }
        Ok(())
    }
}
