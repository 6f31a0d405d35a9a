// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static host inventory as an infrastructure engine.
//!
//! Clusters are built from pre-existing machines listed in a JSON file:
//!
//! ```json
//! {
//!   "flavors": { "m1.large": { "ram": 8192, "vcpus": 4 } },
//!   "hosts": [
//!     { "name": "node-01", "address": "10.0.0.11", "flavor": "m1.large" },
//!     { "name": "node-02", "address": "10.0.0.12", "management_ip": "192.168.1.12", "flavor": "m1.large" }
//!   ]
//! }
//! ```
//!
//! A host belongs to at most one cluster. Allocations are rebuilt from stored
//! clusters on startup, so a restart does not hand out a host twice.
//!
//! While an operation runs, the hosts it allocated are listed in the
//! cluster's `rollback_info`. A failed creation releases every host and
//! reports the cluster unusable. A failed scaling releases only the new hosts
//! and reports the cluster usable.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use cirrus_core::error::CoreError;
use cirrus_core::group::{ConcurrencyGroup, DEFAULT_POOL_SIZE};
use cirrus_core::infra::{self, InfraEngine, InfraError};
use cirrus_core::model::{Cluster, ClusterStatus, Instance, NodeGroup};
use cirrus_core::persistence::Persistence;
use cirrus_core::progress::{EventTarget, ProgressTracker, StepSpec};
use cirrus_core::quotas::{Flavor, Limits, QuotaError, QuotaProvider};
use cirrus_core::remote::{CommandOptions, RemoteError, RemoteExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Engine name recorded in `engine_info`.
pub const ENGINE_TYPE: &str = "inventory";
const ENGINE_VERSION: &str = "1.0";

const STEP_WAIT_ACCESSIBLE: &str = "Wait for instances to become accessible";
const STEP_CONFIGURE_HOSTS: &str = "Configure instances";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Failed to read inventory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid inventory: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Host '{host}' uses unknown flavor '{flavor}'")]
    UnknownFlavor { host: String, flavor: String },

    #[error("Host '{0}' is listed more than once")]
    DuplicateHost(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorSpec {
    /// Memory in MB.
    pub ram: i64,
    pub vcpus: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub management_ip: Option<String>,
    pub flavor: String,
}

/// Machines available to clusters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub flavors: HashMap<String, FlavorSpec>,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl Inventory {
    pub fn from_json(json: &str) -> Result<Self, InventoryError> {
        let inventory: Self = serde_json::from_str(json)?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), InventoryError> {
        let mut names = HashSet::new();
        for host in &self.hosts {
            if !names.insert(host.name.as_str()) {
                return Err(InventoryError::DuplicateHost(host.name.clone()));
            }
            if !self.flavors.contains_key(&host.flavor) {
                return Err(InventoryError::UnknownFlavor {
                    host: host.name.clone(),
                    flavor: host.flavor.clone(),
                });
            }
        }
        Ok(())
    }

    fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|host| host.name == name)
    }
}

/// What an in-flight operation allocated, kept in `Cluster::rollback_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RollbackInfo {
    operation: String,
    #[serde(default)]
    allocated: Vec<String>,
    #[serde(default)]
    instances: Vec<String>,
    /// Hosts leaving the cluster once the new topology is stored.
    #[serde(default)]
    released: Vec<String>,
}

impl RollbackInfo {
    fn to_value(&self) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self)?)
    }

    fn of(cluster: &Cluster) -> Option<Self> {
        if cluster.rollback_info.is_null() {
            return None;
        }
        match serde_json::from_value(cluster.rollback_info.clone()) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(cluster_id = %cluster.id, error = %e, "Ignoring unreadable rollback info");
                None
            }
        }
    }
}

/// [`InfraEngine`] over a static [`Inventory`].
pub struct InventoryEngine {
    inventory: Inventory,
    persistence: Arc<dyn Persistence>,
    remote: RemoteExecutor,
    progress: Arc<ProgressTracker>,
    /// Host name to owning cluster id.
    allocations: Mutex<HashMap<String, String>>,
    image_username: String,
    pool_size: usize,
    probe_timeout: Duration,
    poll_interval: Duration,
}

impl InventoryEngine {
    pub fn new(
        inventory: Inventory,
        persistence: Arc<dyn Persistence>,
        remote: RemoteExecutor,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            inventory,
            persistence,
            remote,
            progress,
            allocations: Mutex::new(HashMap::new()),
            image_username: "root".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Load the inventory file and restore allocations of stored clusters.
    pub async fn open(
        path: impl AsRef<Path>,
        persistence: Arc<dyn Persistence>,
        remote: RemoteExecutor,
        progress: Arc<ProgressTracker>,
    ) -> Result<Self, InventoryError> {
        let inventory = Inventory::load(path).await?;
        let engine = Self::new(inventory, persistence, remote, progress);
        engine.restore().await?;
        Ok(engine)
    }

    /// User the hosts are logged into.
    pub fn with_image_username(mut self, username: impl Into<String>) -> Self {
        self.image_username = username.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// How long a host may stay unreachable before the operation fails.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Mark hosts used by stored clusters as allocated.
    pub async fn restore(&self) -> Result<(), CoreError> {
        let clusters = self.persistence.list_clusters(None).await?;
        let mut allocations = self.lock_allocations();
        for cluster in &clusters {
            let info = RollbackInfo::of(cluster).unwrap_or_default();
            let hosts = cluster
                .instances()
                .filter_map(|instance| instance.instance_id.clone())
                .chain(info.allocated);
            for host in hosts {
                if self.inventory.host(&host).is_some() {
                    allocations.insert(host, cluster.id.clone());
                }
            }
        }
        info!(allocated = allocations.len(), hosts = self.inventory.hosts.len(), "Inventory allocations restored");
        Ok(())
    }

    /// Hosts not owned by any cluster, optionally of one flavor.
    pub fn free_hosts(&self, flavor: Option<&str>) -> Vec<Host> {
        let allocations = self.lock_allocations();
        self.inventory
            .hosts
            .iter()
            .filter(|host| !allocations.contains_key(&host.name))
            .filter(|host| flavor.is_none_or(|f| host.flavor == f))
            .cloned()
            .collect()
    }

    /// Hosts currently owned by `cluster_id`.
    pub fn hosts_of(&self, cluster_id: &str) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .lock_allocations()
            .iter()
            .filter(|(_, owner)| owner.as_str() == cluster_id)
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    fn lock_allocations(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim hosts for every `(flavor, count)` request, all or nothing.
    fn allocate(&self, cluster_id: &str, requests: &[(&str, usize)]) -> infra::Result<Vec<Host>> {
        let mut allocations = self.lock_allocations();
        let mut claimed: Vec<Host> = Vec::new();
        for &(flavor, count) in requests {
            let free: Vec<&Host> = self
                .inventory
                .hosts
                .iter()
                .filter(|host| host.flavor == flavor)
                .filter(|host| !allocations.contains_key(&host.name))
                .filter(|host| !claimed.iter().any(|c| c.name == host.name))
                .take(count)
                .collect();
            if free.len() < count {
                return Err(InfraError::Provisioning(format!(
                    "Not enough free hosts with flavor '{flavor}': requested {count}, available {}",
                    free.len()
                )));
            }
            claimed.extend(free.into_iter().cloned());
        }
        for host in &claimed {
            allocations.insert(host.name.clone(), cluster_id.to_string());
        }
        Ok(claimed)
    }

    fn release(&self, cluster_id: &str, hosts: &[String]) {
        let mut allocations = self.lock_allocations();
        for host in hosts {
            if allocations.get(host).is_some_and(|owner| owner == cluster_id) {
                allocations.remove(host);
            }
        }
    }

    fn release_cluster(&self, cluster_id: &str) {
        self.lock_allocations()
            .retain(|_, owner| owner.as_str() != cluster_id);
    }

    /// Move the cluster to an engine-owned status.
    async fn set_status(&self, cluster_id: &str, status: ClusterStatus) -> infra::Result<Cluster> {
        let current = self.persistence.get_cluster(cluster_id).await?;
        if current.is_none_or(|c| c.status == ClusterStatus::Deleting) {
            return Err(InfraError::ClusterVanished(cluster_id.to_string()));
        }
        self.persistence
            .update_cluster_status(cluster_id, status, "")
            .await?
            .ok_or_else(|| InfraError::ClusterVanished(cluster_id.to_string()))
    }

    async fn reload(&self, cluster_id: &str) -> infra::Result<Cluster> {
        self.persistence
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| InfraError::ClusterVanished(cluster_id.to_string()))
    }

    /// Wait until every instance accepts remote commands.
    async fn await_accessible(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        instances: Vec<Instance>,
    ) -> infra::Result<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let spec = StepSpec::new(STEP_WAIT_ACCESSIBLE, instances.len() as u32);
        let mut group = ConcurrencyGroup::with_pool_size(ctx, self.pool_size);

        for instance in instances {
            let remote = self.remote.clone();
            let progress = Arc::clone(&self.progress);
            let spec = spec.clone();
            let cluster_id = cluster_id.to_string();
            let (timeout, interval) = (self.probe_timeout, self.poll_interval);
            group.spawn(
                format!("wait-for-{}", instance.instance_name),
                move |ctx| async move {
                    let ctx = ctx.for_instance(instance.instance_name.clone());
                    let target = EventTarget::Instance {
                        cluster_id: &cluster_id,
                        instance: &instance,
                    };
                    progress
                        .wrap(&ctx, &spec, target, async {
                            wait_accessible(&remote, &instance, timeout, interval).await?;
                            Ok::<_, anyhow::Error>(())
                        })
                        .await
                },
            );
        }

        group.join().await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Write `/etc/hosts` listing every instance of the cluster.
    async fn configure_hosts(&self, ctx: &RequestContext, cluster: &Cluster) -> infra::Result<()> {
        let instances: Vec<Instance> = cluster.instances().cloned().collect();
        if instances.is_empty() {
            return Ok(());
        }
        let hosts_file = Arc::new(etc_hosts(cluster));
        let spec = StepSpec::new(STEP_CONFIGURE_HOSTS, instances.len() as u32);
        let mut group = ConcurrencyGroup::with_pool_size(ctx, self.pool_size);

        for instance in instances {
            let remote = self.remote.clone();
            let progress = Arc::clone(&self.progress);
            let spec = spec.clone();
            let cluster_id = cluster.id.clone();
            let hosts_file = Arc::clone(&hosts_file);
            group.spawn(
                format!("configure-{}", instance.instance_name),
                move |ctx| async move {
                    let target = EventTarget::Instance {
                        cluster_id: &cluster_id,
                        instance: &instance,
                    };
                    progress
                        .wrap(&ctx, &spec, target, async {
                            let mut session = remote.session(&instance).await?;
                            let written = session
                                .write_file_as_root("/etc/hosts", hosts_file.as_bytes())
                                .await;
                            session.close().await;
                            written?;
                            Ok::<_, anyhow::Error>(())
                        })
                        .await
                },
            );
        }

        group.join().await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn instance_for(cluster: &Cluster, node_group: &NodeGroup, index: usize, host: &Host) -> Instance {
        Instance {
            id: uuid::Uuid::new_v4().to_string(),
            node_group_id: node_group.id.clone(),
            instance_id: Some(host.name.clone()),
            instance_name: format!("{}-{}-{:03}", cluster.name, node_group.name, index)
                .to_lowercase(),
            internal_ip: Some(host.address.clone()),
            management_ip: Some(
                host.management_ip
                    .clone()
                    .unwrap_or_else(|| host.address.clone()),
            ),
        }
    }
}

/// Poll `instance` until it runs a command or `timeout` runs out.
async fn wait_accessible(
    remote: &RemoteExecutor,
    instance: &Instance,
    timeout: Duration,
    interval: Duration,
) -> Result<(), RemoteError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let options = CommandOptions::default().with_timeout(remaining);
        match remote.execute_command(instance, "hostname", options).await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() + interval < deadline => {
                debug!(instance = %instance.instance_name, error = %e, "Instance not accessible yet");
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn etc_hosts(cluster: &Cluster) -> String {
    let mut hosts = String::from("127.0.0.1 localhost\n");
    for instance in cluster.instances() {
        if let Some(ip) = &instance.internal_ip {
            let _ = writeln!(hosts, "{ip} {}", instance.instance_name);
        }
    }
    hosts
}

#[async_trait]
impl InfraEngine for InventoryEngine {
    fn type_and_version(&self) -> String {
        format!("{ENGINE_TYPE}.{ENGINE_VERSION}")
    }

    async fn node_group_image_username(
        &self,
        _ctx: &RequestContext,
        node_group: &NodeGroup,
    ) -> infra::Result<String> {
        Ok(node_group
            .image_username
            .clone()
            .unwrap_or_else(|| self.image_username.clone()))
    }

    #[instrument(skip(self, ctx, cluster), fields(cluster_id = %cluster.id))]
    async fn create_cluster(&self, ctx: &RequestContext, cluster: &Cluster) -> infra::Result<()> {
        let mut cluster = self.set_status(&cluster.id, ClusterStatus::Spawning).await?;

        let requests: Vec<(&str, usize)> = cluster
            .node_groups
            .iter()
            .map(|ng| (ng.flavor_id.as_str(), ng.count as usize))
            .collect();
        let hosts = self.allocate(&cluster.id, &requests)?;
        let allocated: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();

        let snapshot = cluster.clone();
        let mut hosts = hosts.into_iter();
        for node_group in cluster.node_groups.iter_mut() {
            let mut instances = Vec::with_capacity(node_group.count as usize);
            for index in 1..=node_group.count as usize {
                if let Some(host) = hosts.next() {
                    instances.push(Self::instance_for(&snapshot, node_group, index, &host));
                }
            }
            node_group.instances = instances;
        }
        cluster.rollback_info = RollbackInfo {
            operation: "create".to_string(),
            allocated,
            ..RollbackInfo::default()
        }
        .to_value()?;
        self.persistence.update_cluster(&cluster).await?;
        info!(instances = cluster.instances().count(), "Hosts allocated");

        self.set_status(&cluster.id, ClusterStatus::Waiting).await?;
        self.await_accessible(ctx, &cluster.id, cluster.instances().cloned().collect())
            .await?;

        let mut cluster = self.set_status(&cluster.id, ClusterStatus::Preparing).await?;
        self.configure_hosts(ctx, &cluster).await?;

        cluster.rollback_info = Value::Null;
        self.persistence.update_cluster(&cluster).await?;
        Ok(())
    }

    #[instrument(skip(self, ctx, cluster, node_group_counts), fields(cluster_id = %cluster.id))]
    async fn scale_cluster(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        node_group_counts: &HashMap<String, u32>,
    ) -> infra::Result<Vec<String>> {
        let mut cluster = self.reload(&cluster.id).await?;

        let mut released = Vec::new();
        let mut requests: Vec<(String, usize)> = Vec::new();
        for node_group in &cluster.node_groups {
            let Some(&target) = node_group_counts.get(&node_group.id) else {
                continue;
            };
            let target = target as usize;
            let current = node_group.instances.len();
            if current > target {
                released.extend(
                    node_group.instances[target..]
                        .iter()
                        .filter_map(|instance| instance.instance_id.clone()),
                );
            } else if current < target {
                requests.push((node_group.flavor_id.clone(), target - current));
            }
        }

        // Stored topology is untouched until the new hosts are claimed.
        cluster.rollback_info = RollbackInfo {
            operation: "scale".to_string(),
            released: released.clone(),
            ..RollbackInfo::default()
        }
        .to_value()?;
        self.persistence.update_cluster(&cluster).await?;

        let request_refs: Vec<(&str, usize)> =
            requests.iter().map(|(f, n)| (f.as_str(), *n)).collect();
        let hosts = self.allocate(&cluster.id, &request_refs)?;
        let allocated: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();

        let mut hosts = hosts.into_iter();
        let mut new_instances = Vec::new();
        let snapshot = cluster.clone();
        for node_group in cluster.node_groups.iter_mut() {
            let Some(&target) = node_group_counts.get(&node_group.id) else {
                continue;
            };
            let target = target as usize;
            node_group.instances.truncate(target);
            for index in node_group.instances.len() + 1..=target {
                if let Some(host) = hosts.next() {
                    let instance = Self::instance_for(&snapshot, node_group, index, &host);
                    new_instances.push(instance.clone());
                    node_group.instances.push(instance);
                }
            }
            node_group.count = target as u32;
        }
        let new_ids: Vec<String> = new_instances.iter().map(|i| i.id.clone()).collect();

        cluster.rollback_info = RollbackInfo {
            operation: "scale".to_string(),
            allocated: allocated.clone(),
            instances: new_ids.clone(),
            released: released.clone(),
        }
        .to_value()?;
        if let Err(e) = self.persistence.update_cluster(&cluster).await {
            self.release(&cluster.id, &allocated);
            return Err(e.into());
        }
        self.release(&cluster.id, &released);
        if !released.is_empty() {
            info!(released = released.len(), "Hosts released");
        }

        if !new_instances.is_empty() {
            self.await_accessible(ctx, &cluster.id, new_instances).await?;
        }
        let mut cluster = self.reload(&cluster.id).await?;
        self.configure_hosts(ctx, &cluster).await?;

        cluster.rollback_info = Value::Null;
        self.persistence.update_cluster(&cluster).await?;
        info!(added = new_ids.len(), "Cluster infrastructure scaled");
        Ok(new_ids)
    }

    async fn rollback_cluster(
        &self,
        _ctx: &RequestContext,
        cluster: &Cluster,
        reason: &str,
    ) -> infra::Result<bool> {
        let mut cluster = self.reload(&cluster.id).await?;
        let Some(info) = RollbackInfo::of(&cluster) else {
            debug!(cluster_id = %cluster.id, "Nothing to roll back");
            return Ok(false);
        };
        warn!(cluster_id = %cluster.id, operation = %info.operation, reason = %reason, "Rolling back cluster infrastructure");

        let recovered = match info.operation.as_str() {
            "scale" => {
                let added: HashSet<&str> = info.instances.iter().map(String::as_str).collect();
                for node_group in cluster.node_groups.iter_mut() {
                    let before = node_group.instances.len();
                    node_group
                        .instances
                        .retain(|instance| !added.contains(instance.id.as_str()));
                    if node_group.instances.len() != before {
                        node_group.count = node_group.instances.len() as u32;
                    }
                }
                let in_use: HashSet<String> = cluster
                    .instances()
                    .filter_map(|instance| instance.instance_id.clone())
                    .collect();
                let unused: Vec<String> = info
                    .allocated
                    .iter()
                    .chain(&info.released)
                    .filter(|host| !in_use.contains(*host))
                    .cloned()
                    .collect();
                self.release(&cluster.id, &unused);
                true
            }
            _ => {
                self.release_cluster(&cluster.id);
                for node_group in cluster.node_groups.iter_mut() {
                    node_group.instances.clear();
                }
                false
            }
        };

        cluster.rollback_info = Value::Null;
        self.persistence.update_cluster(&cluster).await?;
        Ok(recovered)
    }

    #[instrument(skip(self, _ctx, cluster), fields(cluster_id = %cluster.id))]
    async fn shutdown_cluster(&self, _ctx: &RequestContext, cluster: &Cluster) -> infra::Result<()> {
        let released = self.hosts_of(&cluster.id);
        self.release_cluster(&cluster.id);

        if let Some(mut current) = self.persistence.get_cluster(&cluster.id).await? {
            for node_group in current.node_groups.iter_mut() {
                node_group.instances.clear();
            }
            current.rollback_info = Value::Null;
            self.persistence.update_cluster(&current).await?;
        }
        info!(released = released.len(), "Cluster hosts released");
        Ok(())
    }
}

/// Quota provider backed by the free hosts of an [`InventoryEngine`].
///
/// Instance, RAM and VCPU limits are what the free hosts offer; the inventory
/// has no networking or volume limits.
pub struct InventoryQuotas {
    engine: Arc<InventoryEngine>,
}

impl InventoryQuotas {
    pub fn new(engine: Arc<InventoryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl QuotaProvider for InventoryQuotas {
    async fn flavor(&self, _ctx: &RequestContext, flavor_id: &str) -> Result<Flavor, QuotaError> {
        self.engine
            .inventory
            .flavors
            .get(flavor_id)
            .map(|spec| Flavor {
                ram: spec.ram,
                vcpus: spec.vcpus,
            })
            .ok_or_else(|| QuotaError::FlavorNotFound(flavor_id.to_string()))
    }

    async fn available_limits(&self, _ctx: &RequestContext) -> Result<Limits, QuotaError> {
        let free = self.engine.free_hosts(None);
        let mut limits = Limits::unlimited();
        limits.instances = free.len() as i64;
        limits.ram = 0;
        limits.cpu = 0;
        for host in &free {
            if let Some(spec) = self.engine.inventory.flavors.get(&host.flavor) {
                limits.ram += spec.ram;
                limits.cpu += spec.vcpus;
            }
        }
        Ok(limits)
    }
}
