// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster health verification.
//!
//! A verification runs a set of health checks against an active cluster and
//! records the outcome under the cluster's `extra["verification"]` entry. The
//! overall status is the worst check status: `GREEN`, `YELLOW` or `RED`.
//! While checks run the status is `CHECKING`; a second verification is
//! refused until the first finishes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cirrus_core::context::RequestContext;
use cirrus_core::error::CoreError;
use cirrus_core::group::{ConcurrencyGroup, DEFAULT_POOL_SIZE};
use cirrus_core::model::{Cluster, ClusterStatus};
use cirrus_core::persistence::Persistence;
use cirrus_core::remote::{CommandOptions, RemoteExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Key of the verification record in `Cluster::extra`.
pub const VERIFICATION_KEY: &str = "verification";

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// Verification cannot start now.
    #[error("Cannot verify cluster: {0}")]
    CannotVerify(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid verification record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Request to start checks. Never stored.
    Start,
    Checking,
    Green,
    Yellow,
    Red,
}

/// Body of a `handle_verification` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub status: VerificationStatus,
}

impl VerificationRequest {
    pub fn start() -> Self {
        Self {
            status: VerificationStatus::Start,
        }
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: VerificationStatus,
    pub description: String,
}

/// Verification state stored on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub status: VerificationStatus,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    /// Read the record from a cluster, if present.
    pub fn of(cluster: &Cluster) -> Result<Option<Self>, VerificationError> {
        cluster
            .extra
            .get(VERIFICATION_KEY)
            .filter(|value| !value.is_null())
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(VerificationError::from)
    }

    fn to_value(&self) -> Result<Value, VerificationError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Health verification hooks used by the lifecycle and the ops dispatcher.
#[async_trait]
pub trait HealthVerifier: Send + Sync {
    /// Fail with [`VerificationError::CannotVerify`] if checks cannot start.
    async fn validate_start(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), VerificationError>;

    /// Act on a verification request.
    async fn handle(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: &VerificationRequest,
    ) -> Result<(), VerificationError>;

    /// Drop stored verification data.
    async fn clean(&self, ctx: &RequestContext, cluster_id: &str)
    -> Result<(), VerificationError>;
}

/// Verifications switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledVerifier;

#[async_trait]
impl HealthVerifier for DisabledVerifier {
    async fn validate_start(
        &self,
        _ctx: &RequestContext,
        _cluster_id: &str,
    ) -> Result<(), VerificationError> {
        Err(VerificationError::CannotVerify(
            "verifications are disabled".to_string(),
        ))
    }

    async fn handle(
        &self,
        _ctx: &RequestContext,
        _cluster_id: &str,
        _request: &VerificationRequest,
    ) -> Result<(), VerificationError> {
        Ok(())
    }

    async fn clean(
        &self,
        _ctx: &RequestContext,
        _cluster_id: &str,
    ) -> Result<(), VerificationError> {
        Ok(())
    }
}

/// Checks that every instance accepts remote commands.
///
/// All reachable gives `GREEN`, some unreachable `YELLOW`, none reachable (or
/// no instances at all) `RED`.
pub struct InstanceHealthVerifier {
    persistence: Arc<dyn Persistence>,
    remote: RemoteExecutor,
    pool_size: usize,
}

impl InstanceHealthVerifier {
    pub fn new(persistence: Arc<dyn Persistence>, remote: RemoteExecutor) -> Self {
        Self {
            persistence,
            remote,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    async fn write(
        &self,
        cluster_id: &str,
        verification: &Verification,
    ) -> Result<bool, VerificationError> {
        Ok(self
            .persistence
            .update_cluster_extra(cluster_id, VERIFICATION_KEY, &verification.to_value()?)
            .await?)
    }

    async fn probe_instances(&self, ctx: &RequestContext, cluster: &Cluster) -> Vec<HealthCheck> {
        let results = Arc::new(Mutex::new(Vec::new()));
        let mut group = ConcurrencyGroup::with_pool_size(ctx, self.pool_size);

        for instance in cluster.instances().cloned() {
            let remote = self.remote.clone();
            let results = Arc::clone(&results);
            group.spawn(
                format!("health-check-{}", instance.instance_name),
                move |_ctx| async move {
                    let options = CommandOptions::default().with_timeout(PROBE_TIMEOUT);
                    let check = match remote.execute_command(&instance, "hostname", options).await {
                        Ok(_) => HealthCheck {
                            name: instance.instance_name.clone(),
                            status: VerificationStatus::Green,
                            description: "Instance is reachable".to_string(),
                        },
                        Err(e) => HealthCheck {
                            name: instance.instance_name.clone(),
                            status: VerificationStatus::Red,
                            description: e.to_string(),
                        },
                    };
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(check);
                    Ok(())
                },
            );
        }

        if let Err(e) = group.join().await {
            debug!(error = %e, "Health probe unit failed");
        }

        let mut checks = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        checks.sort_by(|a, b| a.name.cmp(&b.name));
        checks
    }
}

fn overall_status(checks: &[HealthCheck]) -> VerificationStatus {
    let healthy = checks
        .iter()
        .filter(|c| c.status == VerificationStatus::Green)
        .count();
    if healthy == 0 {
        VerificationStatus::Red
    } else if healthy < checks.len() {
        VerificationStatus::Yellow
    } else {
        VerificationStatus::Green
    }
}

#[async_trait]
impl HealthVerifier for InstanceHealthVerifier {
    async fn validate_start(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), VerificationError> {
        let cluster = self.persistence.require_cluster(cluster_id).await?;
        if cluster.status != ClusterStatus::Active {
            return Err(VerificationError::CannotVerify(format!(
                "cluster is in {} status",
                cluster.status
            )));
        }
        if let Some(current) = Verification::of(&cluster)?
            && current.status == VerificationStatus::Checking
        {
            return Err(VerificationError::CannotVerify(
                "cluster is already being verified".to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, ctx, request), fields(status = ?request.status))]
    async fn handle(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: &VerificationRequest,
    ) -> Result<(), VerificationError> {
        if request.status != VerificationStatus::Start {
            debug!("Ignoring verification request that does not start checks");
            return Ok(());
        }

        let checking = Verification {
            status: VerificationStatus::Checking,
            checks: Vec::new(),
            updated_at: Utc::now(),
        };
        if !self.write(cluster_id, &checking).await? {
            return Ok(());
        }

        let cluster = self.persistence.require_cluster(cluster_id).await?;
        let checks = self.probe_instances(ctx, &cluster).await;
        let verification = Verification {
            status: overall_status(&checks),
            checks,
            updated_at: Utc::now(),
        };
        info!(status = ?verification.status, "Cluster verification finished");
        self.write(cluster_id, &verification).await?;
        Ok(())
    }

    async fn clean(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<(), VerificationError> {
        let Some(cluster) = self.persistence.get_cluster(cluster_id).await? else {
            return Ok(());
        };
        if Verification::of(&cluster)?.is_some() {
            self.persistence
                .update_cluster_extra(cluster_id, VERIFICATION_KEY, &Value::Null)
                .await?;
        }
        Ok(())
    }
}
