// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-engine.

use cirrus_core::error::CoreError;
use cirrus_core::group::GroupError;
use cirrus_core::infra::InfraError;
use cirrus_core::model::ClusterStatus;
use cirrus_core::plugin::PluginError;
use cirrus_core::quotas::QuotaError;
use thiserror::Error;

use crate::jobs::JobError;
use crate::rpc::RpcError;
use crate::verification::VerificationError;

/// Errors from cluster operations and request validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisioningError {
    /// Persistence failed or a record is missing.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Plugin rejected or failed the operation.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Infrastructure engine failed.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// Request exceeds available resources.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// A unit of a fan-out failed.
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Job handling failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Verification could not be started.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Operation could not be handed to the ops dispatcher.
    #[error(transparent)]
    Dispatch(#[from] RpcError),

    /// The cluster was deleted while an operation ran.
    #[error("Cluster '{0}' no longer exists")]
    ClusterVanished(String),

    /// Cluster is not in a status that allows the operation.
    #[error("Cluster '{cluster_id}' cannot be {operation} in '{status}' status")]
    InvalidStatus {
        cluster_id: String,
        operation: &'static str,
        status: ClusterStatus,
    },

    /// Scaling with a different infrastructure engine than the cluster was
    /// created with.
    #[error(
        "Cluster created with {created} infrastructure engine can't be scaled with {current} engine"
    )]
    IncompatibleEngine { created: String, current: String },

    /// Request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type using [`ProvisioningError`].
pub type Result<T> = std::result::Result<T, ProvisioningError>;

impl ProvisioningError {
    /// Short machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_code(),
            Self::Plugin(_) => "PLUGIN_ERROR",
            Self::Infra(_) => "INFRA_ERROR",
            Self::Quota(_) => "QUOTA_EXCEEDED",
            Self::Group(_) => "UNIT_FAILED",
            Self::Job(_) => "JOB_ERROR",
            Self::Verification(_) => "VERIFICATION_ERROR",
            Self::Dispatch(_) => "DISPATCH_ERROR",
            Self::ClusterVanished(_) => "CLUSTER_NOT_FOUND",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::IncompatibleEngine { .. } => "INCOMPATIBLE_ENGINE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}
