// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in provisioning plugins.
//!
//! [`FakePlugin`] deploys no real distribution. It writes a small
//! configuration file to every node and touches a marker when "starting"
//! services, which is enough to exercise the full lifecycle against real
//! machines or a mock transport.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use cirrus_core::group::{ConcurrencyGroup, DEFAULT_POOL_SIZE};
use cirrus_core::model::{Cluster, Instance, NodeGroup};
use cirrus_core::plugin::{self, PluginError, ProvisioningPlugin};
use cirrus_core::progress::{EventTarget, ProgressTracker, StepSpec};
use cirrus_core::remote::{CommandOptions, RemoteExecutor};
use tracing::{debug, info};

pub const FAKE_PLUGIN_NAME: &str = "fake";
pub const FAKE_PLUGIN_VERSION: &str = "0.1";

/// Configuration file written to every node.
pub const CONFIG_PATH: &str = "/etc/cirrus/fake.conf";
/// Marker touched when services start.
pub const STARTED_MARKER: &str = "/var/run/cirrus-fake.started";

/// Processes that may run on at most one node.
const SINGLETON_PROCESSES: &[&str] = &["namenode", "resourcemanager"];

fn process_ports(process: &str) -> &'static [u16] {
    match process {
        "namenode" => &[8020, 9870],
        "datanode" => &[9864, 9866],
        "resourcemanager" => &[8032, 8088],
        "nodemanager" => &[8042],
        _ => &[],
    }
}

/// Plugin that configures and starts nothing real.
pub struct FakePlugin {
    remote: RemoteExecutor,
    progress: Arc<ProgressTracker>,
    pool_size: usize,
}

impl FakePlugin {
    pub fn new(remote: RemoteExecutor, progress: Arc<ProgressTracker>) -> Self {
        Self {
            remote,
            progress,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Run `action` on every instance, each reported as an event of `step`.
    async fn on_each<F, Fut>(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        step: &str,
        instances: &[Instance],
        action: F,
    ) -> plugin::Result<()>
    where
        F: Fn(RemoteExecutor, Instance) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if instances.is_empty() {
            return Ok(());
        }
        let spec = StepSpec::new(step, instances.len() as u32);
        let mut group = ConcurrencyGroup::with_pool_size(ctx, self.pool_size);

        for instance in instances.iter().cloned() {
            let remote = self.remote.clone();
            let progress = Arc::clone(&self.progress);
            let spec = spec.clone();
            let cluster_id = cluster.id.clone();
            let action = action.clone();
            group.spawn(
                format!("{step}-{}", instance.instance_name),
                move |ctx| async move {
                    let ctx = ctx.for_instance(instance.instance_name.clone());
                    let target = EventTarget::Instance {
                        cluster_id: &cluster_id,
                        instance: &instance,
                    };
                    progress
                        .wrap(&ctx, &spec, target, action(remote, instance.clone()))
                        .await
                },
            );
        }

        group.join().await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn configure(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        let cluster = Arc::new(cluster.clone());
        let shared = Arc::clone(&cluster);
        self.on_each(
            ctx,
            &cluster,
            "Configure cluster",
            instances,
            move |remote, instance| {
                let content = config_file(&shared, &instance);
                async move {
                    let mut session = remote.session(&instance).await?;
                    let written = async {
                        session
                            .execute_command("mkdir -p /etc/cirrus", &CommandOptions::as_root())
                            .await?;
                        session
                            .write_file_as_root(CONFIG_PATH, content.as_bytes())
                            .await
                    }
                    .await;
                    session.close().await;
                    written?;
                    Ok(())
                }
            },
        )
        .await
    }

    async fn start(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        self.on_each(
            ctx,
            cluster,
            "Start the processes",
            instances,
            |remote, instance| async move {
                remote
                    .execute_command(
                        &instance,
                        &format!("touch {STARTED_MARKER}"),
                        CommandOptions::as_root(),
                    )
                    .await?;
                Ok(())
            },
        )
        .await
    }
}

fn config_file(cluster: &Cluster, instance: &Instance) -> String {
    let processes = cluster
        .node_group(&instance.node_group_id)
        .map(|ng| ng.node_processes.join(","))
        .unwrap_or_default();
    format!(
        "cluster={}\ninstance={}\nprocesses={}\n",
        cluster.name, instance.instance_name, processes
    )
}

fn check_layout<'a>(node_groups: impl IntoIterator<Item = (&'a NodeGroup, u32)>) -> plugin::Result<()> {
    let mut total = 0;
    let mut singletons = [0u32; SINGLETON_PROCESSES.len()];
    for (node_group, count) in node_groups {
        total += count;
        for (slot, process) in SINGLETON_PROCESSES.iter().enumerate() {
            if node_group.node_processes.iter().any(|p| p == process) {
                singletons[slot] += count;
            }
        }
    }
    if total == 0 {
        return Err(PluginError::InvalidLayout(
            "cluster must have at least one instance".to_string(),
        ));
    }
    for (process, count) in SINGLETON_PROCESSES.iter().zip(singletons) {
        if count > 1 {
            return Err(PluginError::InvalidLayout(format!(
                "'{process}' must run on at most one instance, got {count}"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ProvisioningPlugin for FakePlugin {
    fn name(&self) -> &str {
        FAKE_PLUGIN_NAME
    }

    fn versions(&self) -> Vec<String> {
        vec![FAKE_PLUGIN_VERSION.to_string()]
    }

    async fn validate(&self, _ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        check_layout(cluster.node_groups.iter().map(|ng| (ng, ng.count)))
    }

    async fn validate_scaling(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
        existing: &std::collections::HashMap<String, u32>,
        additional: &std::collections::HashMap<String, u32>,
    ) -> plugin::Result<()> {
        check_layout(cluster.node_groups.iter().map(|ng| {
            let count = additional
                .get(&ng.id)
                .or_else(|| existing.get(&ng.id))
                .copied()
                .unwrap_or(ng.count);
            (ng, count)
        }))
    }

    async fn configure_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.configure(ctx, cluster, &instances).await?;
        info!(cluster_id = %cluster.id, "Fake plugin configured cluster");
        Ok(())
    }

    async fn start_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        self.start(ctx, cluster, &instances).await?;
        info!(cluster_id = %cluster.id, "Fake plugin started cluster");
        Ok(())
    }

    async fn scale_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        self.configure(ctx, cluster, instances).await?;
        self.start(ctx, cluster, instances).await
    }

    async fn decommission_nodes(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        self.on_each(
            ctx,
            cluster,
            "Decommission nodes",
            instances,
            |remote, instance| async move {
                remote
                    .execute_command(
                        &instance,
                        &format!("rm -f {STARTED_MARKER}"),
                        CommandOptions::as_root().tolerate_failure(),
                    )
                    .await?;
                Ok(())
            },
        )
        .await?;
        debug!(cluster_id = %cluster.id, count = instances.len(), "Nodes decommissioned");
        Ok(())
    }

    fn get_open_ports(&self, node_group: &NodeGroup) -> Vec<u16> {
        let mut ports: Vec<u16> = node_group
            .node_processes
            .iter()
            .flat_map(|process| process_ports(process).iter().copied())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}
