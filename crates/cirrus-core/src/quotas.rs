// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-flight resource quota checks.
//!
//! Before a cluster is created or scaled, [`QuotaChecker`] adds up what the
//! request would consume and compares it with what the provider reports as
//! available. The check is advisory: nothing is reserved, and the provider
//! stays authoritative if another request wins the race.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::context::RequestContext;
use crate::model::{Cluster, NodeGroup};

/// Value a provider reports for a resource without a limit.
pub const UNLIMITED: i64 = i64::MAX;

/// Errors from quota checks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuotaError {
    /// Request needs more of a resource than is available.
    #[error(
        "Quota exceeded for {resource}: Requested {requested}, but available {available}"
    )]
    Exceeded {
        /// Display name of the resource ("RAM", "VCPU", ...).
        resource: &'static str,
        requested: i64,
        available: i64,
    },

    /// A node group references a flavor the provider does not know.
    #[error("Flavor '{0}' not found")]
    FlavorNotFound(String),

    /// The provider could not be queried.
    #[error("Quota provider error: {0}")]
    Provider(String),
}

/// Compute resources of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flavor {
    /// Memory in MB.
    pub ram: i64,
    pub vcpus: i64,
}

/// Networking features that change what a node group consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkingMode {
    pub use_neutron: bool,
    pub use_floating_ips: bool,
}

impl Default for NetworkingMode {
    fn default() -> Self {
        Self {
            use_neutron: false,
            use_floating_ips: true,
        }
    }
}

/// Quantities for every tracked resource. Used both for what a request needs
/// and what a provider has left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub ram: i64,
    pub cpu: i64,
    pub instances: i64,
    pub floating_ips: i64,
    pub security_groups: i64,
    pub security_group_rules: i64,
    pub ports: i64,
    pub volumes: i64,
    pub volume_gbs: i64,
}

impl Limits {
    /// Nothing is limited.
    pub fn unlimited() -> Self {
        Self {
            ram: UNLIMITED,
            cpu: UNLIMITED,
            instances: UNLIMITED,
            floating_ips: UNLIMITED,
            security_groups: UNLIMITED,
            security_group_rules: UNLIMITED,
            ports: UNLIMITED,
            volumes: UNLIMITED,
            volume_gbs: UNLIMITED,
        }
    }

    /// Resources in the order they are checked, with display names.
    pub fn entries(&self) -> [(&'static str, i64); 9] {
        [
            ("RAM", self.ram),
            ("VCPU", self.cpu),
            ("instance", self.instances),
            ("floating ip", self.floating_ips),
            ("security group", self.security_groups),
            ("security group rule", self.security_group_rules),
            ("port", self.ports),
            ("volume", self.volumes),
            ("volume storage", self.volume_gbs),
        ]
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Source of flavors and available quota.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn flavor(&self, ctx: &RequestContext, flavor_id: &str) -> Result<Flavor, QuotaError>;

    /// What the tenant of `ctx` still has available.
    async fn available_limits(&self, ctx: &RequestContext) -> Result<Limits, QuotaError>;
}

/// Compares requested resources against available quota.
#[derive(Clone)]
pub struct QuotaChecker {
    provider: Arc<dyn QuotaProvider>,
    networking: NetworkingMode,
}

impl QuotaChecker {
    pub fn new(provider: Arc<dyn QuotaProvider>, networking: NetworkingMode) -> Self {
        Self {
            provider,
            networking,
        }
    }

    /// Check a new cluster against available quota.
    pub async fn check(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<(), QuotaError> {
        let requested = self.required_cluster_limits(ctx, cluster).await?;
        self.check_limits(ctx, &requested).await
    }

    /// Check a scaling request.
    ///
    /// `to_be_enlarged` maps existing node group ids to new counts;
    /// `additional` maps node groups just added (with count 0) to their
    /// target counts.
    pub async fn check_scaling(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        to_be_enlarged: &HashMap<String, u32>,
        additional: &HashMap<String, u32>,
    ) -> Result<(), QuotaError> {
        let requested = self
            .required_scaling_limits(ctx, cluster, to_be_enlarged, additional)
            .await?;
        self.check_limits(ctx, &requested).await
    }

    /// Resources a full cluster needs.
    pub async fn required_cluster_limits(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
    ) -> Result<Limits, QuotaError> {
        let mut limits = Limits::default();
        for ng in &cluster.node_groups {
            self.add_node_group(ctx, &mut limits, ng, i64::from(ng.count))
                .await?;
        }
        Ok(limits)
    }

    /// Resource delta of a scaling request. Shrinking groups contribute
    /// negative amounts.
    pub async fn required_scaling_limits(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        to_be_enlarged: &HashMap<String, u32>,
        additional: &HashMap<String, u32>,
    ) -> Result<Limits, QuotaError> {
        let mut limits = Limits::default();
        for ng in &cluster.node_groups {
            let target = additional.get(&ng.id).or_else(|| to_be_enlarged.get(&ng.id));
            if let Some(&target) = target {
                let delta = i64::from(target) - i64::from(ng.count);
                self.add_node_group(ctx, &mut limits, ng, delta).await?;
            }
        }
        Ok(limits)
    }

    async fn check_limits(
        &self,
        ctx: &RequestContext,
        requested: &Limits,
    ) -> Result<(), QuotaError> {
        let available = self.provider.available_limits(ctx).await?;
        debug!(requested = %requested, available = %available, "Checking quota");

        for ((resource, requested), (_, available)) in
            requested.entries().into_iter().zip(available.entries())
        {
            if available < requested {
                return Err(QuotaError::Exceeded {
                    resource,
                    requested,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn add_node_group(
        &self,
        ctx: &RequestContext,
        limits: &mut Limits,
        ng: &NodeGroup,
        count: i64,
    ) -> Result<(), QuotaError> {
        let sign = if count < 0 { -1 } else { 1 };
        let flavor = self.provider.flavor(ctx, &ng.flavor_id).await?;

        limits.instances += count;
        limits.ram += flavor.ram * count;
        limits.cpu += flavor.vcpus * count;

        if ng.floating_ip_pool.is_some() {
            limits.floating_ips += count;
        }

        if ng.volumes_per_node > 0 {
            let per_node = i64::from(ng.volumes_per_node);
            limits.volumes += per_node * count;
            limits.volume_gbs += per_node * i64::from(ng.volumes_size) * count;
        }

        if ng.auto_security_group {
            limits.security_groups += sign;
            // Three extra rules open all traffic on the private network.
            let rules = ng.open_ports.len() as i64 + 3;
            if self.networking.use_neutron {
                limits.security_group_rules += rules * sign;
            } else {
                limits.security_group_rules = limits.security_group_rules.max(rules);
            }
        }

        if self.networking.use_neutron {
            limits.ports += count;
        }
        Ok(())
    }
}

/// Fixed flavors and limits, for tests and static deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticQuotaProvider {
    pub flavors: HashMap<String, Flavor>,
    pub available: Limits,
}

impl StaticQuotaProvider {
    pub fn new(available: Limits) -> Self {
        Self {
            flavors: HashMap::new(),
            available,
        }
    }

    pub fn with_flavor(mut self, id: impl Into<String>, ram: i64, vcpus: i64) -> Self {
        self.flavors.insert(id.into(), Flavor { ram, vcpus });
        self
    }
}

#[async_trait]
impl QuotaProvider for StaticQuotaProvider {
    async fn flavor(&self, _ctx: &RequestContext, flavor_id: &str) -> Result<Flavor, QuotaError> {
        self.flavors
            .get(flavor_id)
            .copied()
            .ok_or_else(|| QuotaError::FlavorNotFound(flavor_id.to_string()))
    }

    async fn available_limits(&self, _ctx: &RequestContext) -> Result<Limits, QuotaError> {
        Ok(self.available)
    }
}
