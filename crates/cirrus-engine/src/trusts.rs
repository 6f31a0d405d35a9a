// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trust delegation.
//!
//! Long-running operations act on the user's behalf after the original
//! request has returned. A [`TrustManager`] creates a scoped delegation for a
//! cluster, turns a request context into one that carries it, and removes it
//! when the cluster is terminated.

use std::sync::Arc;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use cirrus_core::error::CoreError;
use cirrus_core::model::Cluster;
use cirrus_core::persistence::Persistence;
use tracing::debug;

/// Credential delegation for cluster operations.
///
/// Every method defaults to a no-op so deployments without delegation can use
/// [`NoTrusts`].
#[async_trait]
pub trait TrustManager: Send + Sync {
    /// Make sure the cluster has a trust. Returns its id, if any.
    async fn create_trust_for_cluster(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
    ) -> Result<Option<String>, CoreError> {
        Ok(cluster.trust_id.clone())
    }

    /// Context that authenticates through the cluster's trust.
    async fn trusted_context(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
    ) -> Result<RequestContext, CoreError> {
        let mut trusted = ctx.clone();
        if cluster.trust_id.is_some() {
            trusted.trust_id = cluster.trust_id.clone();
        }
        Ok(trusted)
    }

    /// Revoke the cluster's trust.
    async fn delete_trust_for_cluster(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Delegation disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrusts;

impl TrustManager for NoTrusts {}

/// Issues local trust ids and records them on the cluster.
pub struct LocalTrusts {
    persistence: Arc<dyn Persistence>,
}

impl LocalTrusts {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl TrustManager for LocalTrusts {
    async fn create_trust_for_cluster(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
    ) -> Result<Option<String>, CoreError> {
        if let Some(trust_id) = &cluster.trust_id {
            return Ok(Some(trust_id.clone()));
        }
        let mut updated = cluster.clone();
        let trust_id = format!("trust-{}", uuid::Uuid::new_v4());
        updated.trust_id = Some(trust_id.clone());
        self.persistence.update_cluster(&updated).await?;
        debug!(cluster_id = %cluster.id, trust_id = %trust_id, "Trust created");
        Ok(Some(trust_id))
    }

    async fn delete_trust_for_cluster(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
    ) -> Result<(), CoreError> {
        let Some(current) = self.persistence.get_cluster(&cluster.id).await? else {
            return Ok(());
        };
        if current.trust_id.is_none() {
            return Ok(());
        }
        let mut updated = current;
        updated.trust_id = None;
        self.persistence.update_cluster(&updated).await?;
        debug!(cluster_id = %cluster.id, "Trust deleted");
        Ok(())
    }
}

/// Create the cluster's trust and return the context to run under.
pub async fn setup_trust(
    trusts: &dyn TrustManager,
    persistence: &dyn Persistence,
    ctx: &RequestContext,
    cluster_id: &str,
) -> Result<RequestContext, CoreError> {
    let cluster = persistence.require_cluster(cluster_id).await?;
    trusts.create_trust_for_cluster(ctx, &cluster).await?;
    let cluster = persistence.require_cluster(cluster_id).await?;
    trusts.trusted_context(ctx, &cluster).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::persistence::MemoryPersistence;

    #[tokio::test]
    async fn test_local_trust_lifecycle() {
        let db = Arc::new(MemoryPersistence::new());
        let cluster = Cluster::new("c", "t", "fake", "0.1", vec![]);
        db.create_cluster(&cluster).await.unwrap();
        let trusts = LocalTrusts::new(db.clone());
        let ctx = RequestContext::new("u", "t");

        let trusted = setup_trust(&trusts, db.as_ref(), &ctx, &cluster.id)
            .await
            .unwrap();
        let stored = db.require_cluster(&cluster.id).await.unwrap();
        assert!(stored.trust_id.is_some());
        assert_eq!(trusted.trust_id, stored.trust_id);

        // Second setup reuses the trust.
        let again = setup_trust(&trusts, db.as_ref(), &ctx, &cluster.id)
            .await
            .unwrap();
        assert_eq!(again.trust_id, stored.trust_id);

        trusts.delete_trust_for_cluster(&ctx, &stored).await.unwrap();
        assert!(db.require_cluster(&cluster.id).await.unwrap().trust_id.is_none());
    }

    #[tokio::test]
    async fn test_no_trusts_keeps_context() {
        let db = Arc::new(MemoryPersistence::new());
        let cluster = Cluster::new("c", "t", "fake", "0.1", vec![]);
        db.create_cluster(&cluster).await.unwrap();
        let ctx = RequestContext::new("u", "t");

        let trusted = setup_trust(&NoTrusts, db.as_ref(), &ctx, &cluster.id)
            .await
            .unwrap();

        assert_eq!(trusted, ctx);
    }
}
