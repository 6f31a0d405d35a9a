// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-core.
//!
//! Storage and lookup failures share one error type so that the engine can map
//! them onto a stable error code.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer and the record lookups built on it.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Cluster was not found.
    #[error("Cluster '{cluster_id}' not found")]
    ClusterNotFound {
        /// The cluster ID that was not found.
        cluster_id: String,
    },

    /// Node group was not found within its cluster.
    #[error("Node group '{node_group_id}' not found in cluster '{cluster_id}'")]
    NodeGroupNotFound {
        /// Owning cluster.
        cluster_id: String,
        /// The node group ID that was not found.
        node_group_id: String,
    },

    /// Provision step was not found.
    #[error("Provision step '{step_id}' not found")]
    StepNotFound {
        /// The step ID that was not found.
        step_id: String,
    },

    /// Job execution was not found.
    #[error("Job execution '{job_id}' not found")]
    JobNotFound {
        /// The job execution ID that was not found.
        job_id: String,
    },

    /// A record already exists under this identifier.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Record kind ("cluster", "job execution").
        kind: &'static str,
        /// The duplicate identifier.
        id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ClusterNotFound { .. } => "CLUSTER_NOT_FOUND",
            Self::NodeGroupNotFound { .. } => "NODE_GROUP_NOT_FOUND",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a cluster lookup miss.
    pub fn cluster_not_found(cluster_id: impl Into<String>) -> Self {
        Self::ClusterNotFound {
            cluster_id: cluster_id.into(),
        }
    }

    /// True when the error means the record is gone rather than broken.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ClusterNotFound { .. }
                | Self::NodeGroupNotFound { .. }
                | Self::StepNotFound { .. }
                | Self::JobNotFound { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
