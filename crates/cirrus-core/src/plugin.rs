// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distribution plugin interface.
//!
//! A plugin knows how to turn provisioned instances into a running Hadoop,
//! Spark or similar cluster. [`ProvisioningPlugin`] has a small required core
//! (`configure_cluster`, `start_cluster`) and default implementations for the
//! optional hooks.
//!
//! Plugins are looked up through an explicit [`PluginRegistry`] built once at
//! startup and passed to whoever needs it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RequestContext;
use crate::model::{Cluster, Instance, NodeGroup};
use crate::remote::RemoteError;

/// Errors raised by plugins.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// No plugin (or no such version) is registered.
    #[error("Plugin '{name}' version '{version}' is not registered")]
    NotFound { name: String, version: String },

    /// Cluster layout is not acceptable to the plugin.
    #[error("Invalid cluster layout: {0}")]
    InvalidLayout(String),

    /// Plugin does not implement the operation.
    #[error("Plugin '{plugin}' does not support {operation}")]
    NotSupported {
        plugin: String,
        operation: &'static str,
    },

    /// Remote operation on a node failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Hooks a distribution plugin provides.
#[async_trait]
pub trait ProvisioningPlugin: Send + Sync {
    /// Registry key, e.g. "vanilla".
    fn name(&self) -> &str;

    /// Supported distribution versions.
    fn versions(&self) -> Vec<String>;

    /// Write configuration to every node.
    async fn configure_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<()>;

    /// Start services on every node.
    async fn start_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<()>;

    /// Reject layouts the plugin cannot run.
    async fn validate(&self, _ctx: &RequestContext, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }

    /// Reject a scaling plan. `existing` maps node group ids to new counts,
    /// `additional` lists node groups being added with their counts.
    ///
    /// Plugins that do not override this cannot be scaled.
    async fn validate_scaling(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _existing: &HashMap<String, u32>,
        _additional: &HashMap<String, u32>,
    ) -> Result<()> {
        Err(PluginError::NotSupported {
            plugin: self.name().to_string(),
            operation: "scaling",
        })
    }

    /// Adjust the cluster definition before infrastructure is created.
    async fn update_infra(&self, _ctx: &RequestContext, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }

    /// Configure and start services on freshly added instances.
    async fn scale_cluster(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _instances: &[Instance],
    ) -> Result<()> {
        Ok(())
    }

    /// Move roles off instances that are about to be deleted.
    async fn decommission_nodes(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _instances: &[Instance],
    ) -> Result<()> {
        Ok(())
    }

    /// Last chance to clean up before infrastructure is torn down.
    async fn on_terminate_cluster(&self, _ctx: &RequestContext, _cluster: &Cluster) -> Result<()> {
        Ok(())
    }

    /// Ports that must be reachable on nodes of `node_group`.
    fn get_open_ports(&self, _node_group: &NodeGroup) -> Vec<u16> {
        Vec::new()
    }
}

/// Plugins available to the service, by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ProvisioningPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin, replacing any with the same name.
    pub fn register(&mut self, plugin: Arc<dyn ProvisioningPlugin>) -> &mut Self {
        self.plugins.insert(plugin.name().to_string(), plugin);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn ProvisioningPlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProvisioningPlugin>> {
        self.plugins.get(name).cloned()
    }

    /// Plugin for a name and version pair.
    pub fn resolve(&self, name: &str, version: &str) -> Result<Arc<dyn ProvisioningPlugin>> {
        self.get(name)
            .filter(|plugin| plugin.versions().iter().any(|v| v == version))
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Plugin a cluster was created with.
    pub fn for_cluster(&self, cluster: &Cluster) -> Result<Arc<dyn ProvisioningPlugin>> {
        self.resolve(&cluster.plugin_name, &cluster.plugin_version)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}
