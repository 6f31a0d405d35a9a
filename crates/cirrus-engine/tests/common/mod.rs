// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for cirrus-engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use cirrus_core::infra::{self, InfraEngine, InfraError};
use cirrus_core::model::{Cluster, ClusterStatus, Instance, NodeGroup};
use cirrus_core::persistence::{MemoryPersistence, Persistence};
use cirrus_core::plugin::{self, PluginError, PluginRegistry, ProvisioningPlugin};
use cirrus_core::remote::{MockTransport, RemoteExecutor};
use cirrus_engine::lifecycle::ClusterLifecycle;

pub const SCRIPTED_ENGINE: &str = "scripted.1.0";
pub const PLUGIN_NAME: &str = "recording";
pub const PLUGIN_VERSION: &str = "1.0";

pub fn ctx() -> RequestContext {
    RequestContext::new("alice", "tenant-a")
}

#[derive(Default)]
struct InfraScript {
    fail_create: Option<String>,
    fail_scale: Option<String>,
    fail_shutdown: Option<String>,
    /// Mark the cluster `Deleting` before a scripted failure is returned.
    delete_on_failure: bool,
    rollback: Option<Result<bool, String>>,
    calls: Vec<String>,
}

/// Infrastructure engine whose failures are set up by the test.
///
/// Instances are created in memory, named `{cluster}-{group}-{n}`.
pub struct ScriptedInfra {
    persistence: Arc<dyn Persistence>,
    script: Mutex<InfraScript>,
}

impl ScriptedInfra {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            script: Mutex::new(InfraScript::default()),
        }
    }

    pub fn fail_create(&self, reason: &str) {
        self.script.lock().unwrap().fail_create = Some(reason.to_string());
    }

    pub fn fail_scale(&self, reason: &str) {
        self.script.lock().unwrap().fail_scale = Some(reason.to_string());
    }

    pub fn fail_shutdown(&self, reason: &str) {
        self.script.lock().unwrap().fail_shutdown = Some(reason.to_string());
    }

    pub fn delete_on_failure(&self) {
        self.script.lock().unwrap().delete_on_failure = true;
    }

    pub fn rollback_returns(&self, recovered: bool) {
        self.script.lock().unwrap().rollback = Some(Ok(recovered));
    }

    pub fn rollback_fails(&self, reason: &str) {
        self.script.lock().unwrap().rollback = Some(Err(reason.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    fn record(&self, call: &str) {
        self.script.lock().unwrap().calls.push(call.to_string());
    }

    async fn scripted_failure(
        &self,
        cluster_id: &str,
        failure: Option<String>,
    ) -> infra::Result<()> {
        let Some(reason) = failure else {
            return Ok(());
        };
        let delete = self.script.lock().unwrap().delete_on_failure;
        if delete {
            self.persistence
                .update_cluster_status(cluster_id, ClusterStatus::Deleting, "")
                .await?;
        }
        Err(InfraError::Provisioning(reason))
    }
}

fn instance(cluster: &Cluster, node_group: &NodeGroup, n: usize) -> Instance {
    let name = format!("{}-{}-{n}", cluster.name, node_group.name);
    Instance {
        id: format!("id-{name}"),
        node_group_id: node_group.id.clone(),
        instance_id: Some(format!("vm-{name}")),
        instance_name: name,
        internal_ip: Some(format!("10.0.0.{n}")),
        management_ip: None,
    }
}

#[async_trait]
impl InfraEngine for ScriptedInfra {
    fn type_and_version(&self) -> String {
        SCRIPTED_ENGINE.to_string()
    }

    async fn create_cluster(&self, _ctx: &RequestContext, cluster: &Cluster) -> infra::Result<()> {
        self.record("create");
        let failure = self.script.lock().unwrap().fail_create.clone();
        self.scripted_failure(&cluster.id, failure).await?;

        let mut current = self.persistence.require_cluster(&cluster.id).await?;
        let snapshot = current.clone();
        for node_group in current.node_groups.iter_mut() {
            node_group.instances = (0..node_group.count as usize)
                .map(|n| instance(&snapshot, node_group, n))
                .collect();
        }
        self.persistence.update_cluster(&current).await?;
        Ok(())
    }

    async fn scale_cluster(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
        node_group_counts: &HashMap<String, u32>,
    ) -> infra::Result<Vec<String>> {
        self.record("scale");
        let failure = self.script.lock().unwrap().fail_scale.clone();
        self.scripted_failure(&cluster.id, failure).await?;

        let mut current = self.persistence.require_cluster(&cluster.id).await?;
        let snapshot = current.clone();
        let mut added = Vec::new();
        for node_group in current.node_groups.iter_mut() {
            let Some(&target) = node_group_counts.get(&node_group.id) else {
                continue;
            };
            let target = target as usize;
            node_group.instances.truncate(target);
            for n in node_group.instances.len()..target {
                let new = instance(&snapshot, node_group, n);
                added.push(new.id.clone());
                node_group.instances.push(new);
            }
            node_group.count = target as u32;
        }
        self.persistence.update_cluster(&current).await?;
        Ok(added)
    }

    async fn rollback_cluster(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _reason: &str,
    ) -> infra::Result<bool> {
        self.record("rollback");
        match self.script.lock().unwrap().rollback.clone() {
            None => Ok(false),
            Some(Ok(recovered)) => Ok(recovered),
            Some(Err(reason)) => Err(InfraError::Provisioning(reason)),
        }
    }

    async fn shutdown_cluster(&self, _ctx: &RequestContext, cluster: &Cluster) -> infra::Result<()> {
        self.record("shutdown");
        let failure = self.script.lock().unwrap().fail_shutdown.clone();
        self.scripted_failure(&cluster.id, failure).await
    }
}

/// Plugin that records which hooks ran and on how many instances.
#[derive(Default)]
pub struct RecordingPlugin {
    calls: Mutex<Vec<String>>,
    fail_configure: Mutex<Option<String>>,
    reject_scaling: Mutex<Option<String>>,
}

impl RecordingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_configure(&self, reason: &str) {
        *self.fail_configure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn reject_scaling(&self, reason: &str) {
        *self.reject_scaling.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn names(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|i| i.instance_name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ProvisioningPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn versions(&self) -> Vec<String> {
        vec![PLUGIN_VERSION.to_string()]
    }

    async fn validate(&self, _ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        if cluster.total_count() == 0 {
            return Err(PluginError::InvalidLayout("no instances".to_string()));
        }
        Ok(())
    }

    async fn validate_scaling(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        _existing: &HashMap<String, u32>,
        _additional: &HashMap<String, u32>,
    ) -> plugin::Result<()> {
        match self.reject_scaling.lock().unwrap().clone() {
            Some(reason) => Err(PluginError::InvalidLayout(reason)),
            None => Ok(()),
        }
    }

    async fn configure_cluster(&self, _ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        self.record(format!("configure:{}", cluster.instances().count()));
        match self.fail_configure.lock().unwrap().clone() {
            Some(reason) => Err(PluginError::Other(anyhow::anyhow!(reason))),
            None => Ok(()),
        }
    }

    async fn start_cluster(&self, _ctx: &RequestContext, cluster: &Cluster) -> plugin::Result<()> {
        self.record(format!("start:{}", cluster.instances().count()));
        Ok(())
    }

    async fn scale_cluster(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        self.record(format!("scale:{}", names(instances)));
        Ok(())
    }

    async fn decommission_nodes(
        &self,
        _ctx: &RequestContext,
        _cluster: &Cluster,
        instances: &[Instance],
    ) -> plugin::Result<()> {
        self.record(format!("decommission:{}", names(instances)));
        Ok(())
    }

    async fn on_terminate_cluster(&self, _ctx: &RequestContext, _cluster: &Cluster) -> plugin::Result<()> {
        self.record("terminate".to_string());
        Ok(())
    }
}

/// Lifecycle over memory persistence, a scripted engine and a recording
/// plugin.
pub struct Harness {
    pub db: Arc<MemoryPersistence>,
    pub infra: Arc<ScriptedInfra>,
    pub plugin: Arc<RecordingPlugin>,
    pub lifecycle: Arc<ClusterLifecycle>,
}

impl Harness {
    pub fn new() -> Self {
        let db = Arc::new(MemoryPersistence::new());
        let infra = Arc::new(ScriptedInfra::new(db.clone()));
        let plugin = Arc::new(RecordingPlugin::new());
        let lifecycle = Arc::new(ClusterLifecycle::new(
            db.clone(),
            PluginRegistry::new().with_plugin(plugin.clone()),
            infra.clone(),
            RemoteExecutor::new(Arc::new(MockTransport::new())),
        ));
        Self {
            db,
            infra,
            plugin,
            lifecycle,
        }
    }

    /// Store a cluster with the given `(name, count)` node groups.
    pub async fn store_cluster(&self, name: &str, groups: &[(&str, u32)]) -> Cluster {
        let node_groups = groups
            .iter()
            .map(|(ng, count)| NodeGroup::new(*ng, "m1.small", *count))
            .collect();
        let cluster = Cluster::new(name, "tenant-a", PLUGIN_NAME, PLUGIN_VERSION, node_groups);
        self.db.create_cluster(&cluster).await.unwrap();
        cluster
    }

    /// Store a cluster and run it through provisioning.
    pub async fn active_cluster(&self, name: &str, groups: &[(&str, u32)]) -> Cluster {
        let cluster = self.store_cluster(name, groups).await;
        self.lifecycle.provision(&ctx(), &cluster.id).await;
        let cluster = self.db.require_cluster(&cluster.id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Active);
        cluster
    }

    pub async fn cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.db.get_cluster(cluster_id).await.unwrap()
    }
}

/// Poll until the cluster reaches `status` or is removed when `status` is
/// `None`.
pub async fn wait_for(
    persistence: &dyn Persistence,
    cluster_id: &str,
    status: Option<ClusterStatus>,
) -> Option<Cluster> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let cluster = persistence.get_cluster(cluster_id).await.unwrap();
            if cluster.as_ref().map(|c| c.status) == status {
                return cluster;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cluster did not reach the expected status")
}
