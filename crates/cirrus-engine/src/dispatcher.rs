// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ops dispatch.
//!
//! The service layer hands long-running work to an [`Ops`] implementation and
//! returns immediately:
//!
//! - [`LocalOps`] runs each operation as a background task in this process.
//! - [`RemoteOps`] sends it over an [`RpcTransport`] to an [`OpsServer`],
//!   which re-creates the caller's context and runs it through `LocalOps`.
//!
//! Everything except [`Ops::get_engine_type_and_version`] is a cast: the
//! caller never sees the outcome, which is recorded on the cluster or job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::jobs::JobError;
use crate::lifecycle::ClusterLifecycle;
use crate::rpc::{CallKind, Incoming, RpcEnvelope, RpcError, RpcReply, RpcTransport};
use crate::verification::VerificationRequest;

/// An operation that can be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum OpsRequest {
    ProvisionCluster {
        cluster_id: String,
    },
    ProvisionScaledCluster {
        cluster_id: String,
        node_group_counts: HashMap<String, u32>,
    },
    TerminateCluster {
        cluster_id: String,
    },
    RunJob {
        job_id: String,
    },
    CancelJob {
        job_id: String,
    },
    DeleteJob {
        job_id: String,
    },
    SuspendJob {
        job_id: String,
    },
    HandleVerification {
        cluster_id: String,
        request: VerificationRequest,
    },
    GetEngineTypeAndVersion,
}

impl OpsRequest {
    /// Wire name of the operation.
    pub fn method(&self) -> &'static str {
        match self {
            Self::ProvisionCluster { .. } => "provision_cluster",
            Self::ProvisionScaledCluster { .. } => "provision_scaled_cluster",
            Self::TerminateCluster { .. } => "terminate_cluster",
            Self::RunJob { .. } => "run_job",
            Self::CancelJob { .. } => "cancel_job",
            Self::DeleteJob { .. } => "delete_job",
            Self::SuspendJob { .. } => "suspend_job",
            Self::HandleVerification { .. } => "handle_verification",
            Self::GetEngineTypeAndVersion => "get_engine_type_and_version",
        }
    }

    /// Cluster the operation changes the lifecycle of, if any.
    ///
    /// Operations on the same cluster are executed one at a time.
    pub fn cluster_id(&self) -> Option<&str> {
        match self {
            Self::ProvisionCluster { cluster_id }
            | Self::ProvisionScaledCluster { cluster_id, .. }
            | Self::TerminateCluster { cluster_id } => Some(cluster_id),
            _ => None,
        }
    }

    /// Name given to the background task.
    pub fn task_name(&self) -> String {
        match self {
            Self::ProvisionCluster { cluster_id } => format!("cluster-creating-{cluster_id}"),
            Self::ProvisionScaledCluster { cluster_id, .. } => {
                format!("cluster-scaling-{cluster_id}")
            }
            Self::TerminateCluster { cluster_id } => format!("cluster-terminating-{cluster_id}"),
            Self::RunJob { job_id } => format!("provisioning-job-run-{job_id}"),
            Self::CancelJob { job_id } => format!("job-canceling-{job_id}"),
            Self::DeleteJob { job_id } => format!("job-deleting-{job_id}"),
            Self::SuspendJob { job_id } => format!("job-suspending-{job_id}"),
            Self::HandleVerification { cluster_id, .. } => {
                format!("handling-verification-{cluster_id}")
            }
            Self::GetEngineTypeAndVersion => "get-engine-type-and-version".to_string(),
        }
    }
}

/// Entry point for long-running operations.
#[async_trait]
pub trait Ops: Send + Sync {
    /// Hand `request` over for background execution.
    async fn cast(&self, ctx: &RequestContext, request: OpsRequest) -> Result<(), RpcError>;

    /// Type and version of the infrastructure engine that executes operations.
    async fn get_engine_type_and_version(&self, ctx: &RequestContext)
    -> Result<String, RpcError>;

    async fn provision_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::ProvisionCluster {
                cluster_id: cluster_id.to_string(),
            },
        )
        .await
    }

    async fn provision_scaled_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_group_counts: HashMap<String, u32>,
    ) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::ProvisionScaledCluster {
                cluster_id: cluster_id.to_string(),
                node_group_counts,
            },
        )
        .await
    }

    async fn terminate_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::TerminateCluster {
                cluster_id: cluster_id.to_string(),
            },
        )
        .await
    }

    async fn run_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::RunJob {
                job_id: job_id.to_string(),
            },
        )
        .await
    }

    async fn cancel_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::CancelJob {
                job_id: job_id.to_string(),
            },
        )
        .await
    }

    async fn delete_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::DeleteJob {
                job_id: job_id.to_string(),
            },
        )
        .await
    }

    async fn suspend_job(&self, ctx: &RequestContext, job_id: &str) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::SuspendJob {
                job_id: job_id.to_string(),
            },
        )
        .await
    }

    async fn handle_verification(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: VerificationRequest,
    ) -> Result<(), RpcError> {
        self.cast(
            ctx,
            OpsRequest::HandleVerification {
                cluster_id: cluster_id.to_string(),
                request,
            },
        )
        .await
    }
}

/// Executes operations against the lifecycle. Failures are logged, never
/// returned.
pub struct OpsHandler {
    lifecycle: Arc<ClusterLifecycle>,
}

impl OpsHandler {
    pub fn new(lifecycle: Arc<ClusterLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &Arc<ClusterLifecycle> {
        &self.lifecycle
    }

    pub fn engine_type_and_version(&self) -> String {
        self.lifecycle.infra().type_and_version()
    }

    pub async fn execute(&self, ctx: &RequestContext, request: &OpsRequest) {
        match request {
            OpsRequest::ProvisionCluster { cluster_id } => {
                self.lifecycle.provision(ctx, cluster_id).await;
            }
            OpsRequest::ProvisionScaledCluster {
                cluster_id,
                node_group_counts,
            } => {
                self.lifecycle
                    .provision_scaled(ctx, cluster_id, node_group_counts)
                    .await;
            }
            OpsRequest::TerminateCluster { cluster_id } => {
                self.lifecycle.terminate(ctx, cluster_id).await;
            }
            OpsRequest::RunJob { job_id } => self.run_job(ctx, job_id).await,
            OpsRequest::CancelJob { job_id } => self.cancel_job(ctx, job_id).await,
            OpsRequest::DeleteJob { job_id } => self.delete_job(ctx, job_id).await,
            OpsRequest::SuspendJob { job_id } => self.suspend_job(ctx, job_id).await,
            OpsRequest::HandleVerification {
                cluster_id,
                request,
            } => {
                if let Err(e) = self
                    .lifecycle
                    .verifier()
                    .handle(ctx, cluster_id, request)
                    .await
                {
                    warn!(cluster_id = %cluster_id, error = %e, "Verification failed");
                }
            }
            OpsRequest::GetEngineTypeAndVersion => {
                debug!(engine = %self.engine_type_and_version(), "Engine type requested by cast");
            }
        }
    }

    async fn run_job(&self, ctx: &RequestContext, job_id: &str) {
        let Some(jobs) = self.lifecycle.jobs() else {
            warn!(job_id = %job_id, "No job engine configured, job not started");
            return;
        };
        if let Err(e) = jobs.run_job(ctx, job_id).await {
            error!(job_id = %job_id, error = %e, "Failed to run job execution");
        }
    }

    async fn cancel_job(&self, ctx: &RequestContext, job_id: &str) {
        let Some(jobs) = self.lifecycle.jobs() else {
            warn!(job_id = %job_id, "No job engine configured, job not canceled");
            return;
        };
        match jobs.cancel_job(ctx, job_id).await {
            Ok(Some(job)) => info!(job_id = %job_id, status = %job.status, "Job canceled"),
            Ok(None) => debug!(job_id = %job_id, "Job execution already removed"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to cancel job execution"),
        }
    }

    async fn suspend_job(&self, ctx: &RequestContext, job_id: &str) {
        let Some(jobs) = self.lifecycle.jobs() else {
            warn!(job_id = %job_id, "No job engine configured, job not suspended");
            return;
        };
        if let Err(e) = jobs.suspend_job(ctx, job_id).await {
            error!(job_id = %job_id, error = %e, "Failed to suspend job execution");
        }
    }

    /// Cancel the job, then remove its record. A job that cannot be stopped
    /// in time is removed anyway.
    async fn delete_job(&self, ctx: &RequestContext, job_id: &str) {
        if let Some(jobs) = self.lifecycle.jobs() {
            match jobs.cancel_job(ctx, job_id).await {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(JobError::CancelingFailed { .. }) => {
                    warn!(job_id = %job_id, "Job execution can't be cancelled in time, deleting it anyway");
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to delete job execution");
                    return;
                }
            }
        }

        match self
            .lifecycle
            .persistence()
            .delete_job_execution(job_id)
            .await
        {
            Ok(true) => info!(job_id = %job_id, "Job execution deleted"),
            Ok(false) => debug!(job_id = %job_id, "Job execution already removed"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to delete job execution"),
        }
    }
}

/// Per-cluster locks. An entry lives while an operation on the cluster runs or
/// waits.
#[derive(Default)]
struct ClusterLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClusterLocks {
    fn lock_for(&self, cluster_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(cluster_id.to_string()).or_default().clone()
    }

    fn release(&self, cluster_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(cluster_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(cluster_id);
        }
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs operations as background tasks of this process.
#[derive(Clone)]
pub struct LocalOps {
    handler: Arc<OpsHandler>,
    locks: Arc<ClusterLocks>,
    in_flight: Arc<InFlight>,
}

impl LocalOps {
    pub fn new(lifecycle: Arc<ClusterLifecycle>) -> Self {
        Self {
            handler: Arc::new(OpsHandler::new(lifecycle)),
            locks: Arc::new(ClusterLocks::default()),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn handler(&self) -> &Arc<OpsHandler> {
        &self.handler
    }

    /// Number of operations still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Number of clusters with an operation running or waiting.
    pub fn locked_clusters(&self) -> usize {
        self.locks.len()
    }

    /// Wait until no operation is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn spawn(&self, ctx: RequestContext, request: OpsRequest) {
        let guard = InFlightGuard::enter(&self.in_flight);
        let handler = Arc::clone(&self.handler);
        let locks = Arc::clone(&self.locks);
        let span = info_span!("ops", task = %request.task_name(), request_id = %ctx.request_id);

        tokio::spawn(
            async move {
                let _guard = guard;
                match request.cluster_id().map(str::to_string) {
                    Some(cluster_id) => {
                        let lock = locks.lock_for(&cluster_id);
                        {
                            let _held = lock.lock().await;
                            handler.execute(&ctx, &request).await;
                        }
                        drop(lock);
                        locks.release(&cluster_id);
                    }
                    None => handler.execute(&ctx, &request).await,
                }
                debug!("Operation finished");
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Ops for LocalOps {
    async fn cast(&self, ctx: &RequestContext, request: OpsRequest) -> Result<(), RpcError> {
        debug!(method = request.method(), "Dispatching operation");
        self.spawn(ctx.clone(), request);
        Ok(())
    }

    async fn get_engine_type_and_version(
        &self,
        _ctx: &RequestContext,
    ) -> Result<String, RpcError> {
        Ok(self.handler.engine_type_and_version())
    }
}

impl std::fmt::Debug for LocalOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOps")
            .field("in_flight", &self.in_flight())
            .field("locked_clusters", &self.locks.len())
            .finish()
    }
}

/// Sends operations to an [`OpsServer`].
#[derive(Clone)]
pub struct RemoteOps {
    transport: Arc<dyn RpcTransport>,
}

impl RemoteOps {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Ops for RemoteOps {
    async fn cast(&self, ctx: &RequestContext, request: OpsRequest) -> Result<(), RpcError> {
        self.transport.cast(RpcEnvelope::cast(ctx, request)).await
    }

    async fn get_engine_type_and_version(
        &self,
        ctx: &RequestContext,
    ) -> Result<String, RpcError> {
        let value = self
            .transport
            .call(RpcEnvelope::call(ctx, OpsRequest::GetEngineTypeAndVersion))
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Executes requests received over RPC.
pub struct OpsServer {
    local: LocalOps,
}

impl OpsServer {
    pub fn new(local: LocalOps) -> Self {
        Self { local }
    }

    /// Drain `incoming` until it closes or `shutdown` flips to `true`.
    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<Incoming>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Ops server started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Ops server received shutdown signal");
                        break;
                    }
                }

                message = incoming.recv() => {
                    match message {
                        Some(message) => self.dispatch(message).await,
                        None => {
                            info!("Ops channel closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn dispatch(&self, message: Incoming) {
        let Incoming { envelope, reply } = message;

        let ctx = match envelope.request_context() {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(method = envelope.request.method(), error = %e, "Rejecting request with invalid context");
                if let Some(reply) = reply {
                    let _ = reply.send(RpcReply::Err {
                        message: e.to_string(),
                    });
                }
                return;
            }
        };

        let outcome = match (envelope.kind, envelope.request) {
            (CallKind::Call, OpsRequest::GetEngineTypeAndVersion) => self
                .local
                .get_engine_type_and_version(&ctx)
                .await
                .map(Value::String),
            (_, request) => self.local.cast(&ctx, request).await.map(|()| Value::Null),
        };

        if let Some(reply_tx) = reply {
            let reply = match outcome {
                Ok(value) => RpcReply::Ok { value },
                Err(e) => RpcReply::Err {
                    message: e.to_string(),
                },
            };
            if reply_tx.send(reply).is_err() {
                debug!("Caller went away before the reply was sent");
            }
        }
    }
}
