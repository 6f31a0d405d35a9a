// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Infrastructure engine interface.
//!
//! An [`InfraEngine`] creates, resizes and deletes the machines a cluster
//! runs on. Engines write instance records and intermediate statuses
//! (`Spawning`, `Waiting`, `Preparing`) through the persistence layer they
//! were built with.
//!
//! Rollback is a capability: the default [`InfraEngine::rollback_cluster`]
//! reports that nothing was undone.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RequestContext;
use crate::error::CoreError;
use crate::model::{Cluster, NodeGroup};
use crate::remote::RemoteError;

/// Errors raised by infrastructure engines.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    /// Provider could not satisfy the request.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Cluster was deleted while the engine was working on it.
    #[error("Cluster '{0}' no longer exists")]
    ClusterVanished(String),

    /// Remote operation on a node failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Persistence failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for infrastructure operations.
pub type Result<T> = std::result::Result<T, InfraError>;

/// Machine lifecycle for clusters.
#[async_trait]
pub trait InfraEngine: Send + Sync {
    /// Engine identifier plus version, recorded on clusters.
    fn type_and_version(&self) -> String;

    /// Login user of the image a node group boots from.
    async fn node_group_image_username(
        &self,
        _ctx: &RequestContext,
        node_group: &NodeGroup,
    ) -> Result<String> {
        Ok(node_group
            .image_username
            .clone()
            .unwrap_or_else(|| "root".to_string()))
    }

    /// Create and prepare every instance the cluster asks for.
    async fn create_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<()>;

    /// Bring node groups to the counts in `node_group_counts`.
    ///
    /// Returns the ids of instances created by this call.
    async fn scale_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        node_group_counts: &HashMap<String, u32>,
    ) -> Result<Vec<String>>;

    /// Undo the effects of a failed operation.
    ///
    /// `Ok(true)` means the cluster is back in a usable state.
    async fn rollback_cluster(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _reason: &str,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Delete every instance of the cluster.
    async fn shutdown_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<()>;
}
