// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host inventory engine and fake plugin driven end to end over a mock
//! transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cirrus_core::context::RequestContext;
use cirrus_core::model::{Cluster, ClusterStatus, NodeGroup};
use cirrus_core::persistence::{MemoryPersistence, Persistence};
use cirrus_core::plugin::PluginRegistry;
use cirrus_core::progress::ProgressTracker;
use cirrus_core::quotas::QuotaProvider;
use cirrus_core::remote::{MockTransport, RemoteExecutor};
use cirrus_engine::inventory::{Inventory, InventoryEngine, InventoryQuotas};
use cirrus_engine::lifecycle::ClusterLifecycle;
use cirrus_engine::plugins::{FakePlugin, STARTED_MARKER};

const INVENTORY: &str = r#"{
    "flavors": {
        "small": {"ram": 2048, "vcpus": 1},
        "large": {"ram": 8192, "vcpus": 4}
    },
    "hosts": [
        {"name": "h1", "address": "10.0.0.1", "flavor": "small"},
        {"name": "h2", "address": "10.0.0.2", "flavor": "small"},
        {"name": "h3", "address": "10.0.0.3", "flavor": "large"}
    ]
}"#;

struct Stack {
    db: Arc<MemoryPersistence>,
    transport: MockTransport,
    engine: Arc<InventoryEngine>,
    lifecycle: ClusterLifecycle,
}

fn ctx() -> RequestContext {
    RequestContext::new("alice", "tenant-a")
}

fn stack() -> Stack {
    let db = Arc::new(MemoryPersistence::new());
    let transport = MockTransport::new();
    let remote = RemoteExecutor::new(Arc::new(transport.clone()));
    let progress = Arc::new(ProgressTracker::new(db.clone()));
    let engine = Arc::new(
        InventoryEngine::new(
            Inventory::from_json(INVENTORY).unwrap(),
            db.clone(),
            remote.clone(),
            progress.clone(),
        )
        .with_probe_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(20)),
    );
    let plugin = Arc::new(FakePlugin::new(remote.clone(), progress.clone()));
    let lifecycle = ClusterLifecycle::new(
        db.clone(),
        PluginRegistry::new().with_plugin(plugin),
        engine.clone(),
        remote,
    )
    .with_progress(progress);
    Stack {
        db,
        transport,
        engine,
        lifecycle,
    }
}

async fn store(db: &MemoryPersistence, workers: u32) -> Cluster {
    let mut master = NodeGroup::new("master", "large", 1);
    master.node_processes = vec!["namenode".to_string()];
    let mut worker = NodeGroup::new("workers", "small", workers);
    worker.node_processes = vec!["datanode".to_string()];
    let cluster = Cluster::new("Analytics", "tenant-a", "fake", "0.1", vec![master, worker]);
    db.create_cluster(&cluster).await.unwrap();
    cluster
}

#[tokio::test]
async fn test_create_on_inventory_hosts() {
    let s = stack();
    let cluster = store(&s.db, 2).await;

    s.lifecycle.provision(&ctx(), &cluster.id).await;

    assert_eq!(
        s.db.status_history(&cluster.id),
        vec![
            ClusterStatus::InfraUpdating,
            ClusterStatus::Spawning,
            ClusterStatus::Waiting,
            ClusterStatus::Preparing,
            ClusterStatus::Configuring,
            ClusterStatus::Starting,
            ClusterStatus::Active,
        ]
    );

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    let names: Vec<&str> = cluster
        .instances()
        .map(|i| i.instance_name.as_str())
        .collect();
    assert_eq!(
        names,
        ["analytics-master-001", "analytics-workers-001", "analytics-workers-002"]
    );
    assert!(cluster.rollback_info.is_null());
    assert_eq!(s.engine.hosts_of(&cluster.id), ["h1", "h2", "h3"]);
    assert!(s.engine.free_hosts(None).is_empty());

    let hosts = s
        .transport
        .file("analytics-workers-002", "/etc/hosts")
        .await
        .unwrap();
    let hosts = String::from_utf8(hosts).unwrap();
    assert!(hosts.contains("10.0.0.3 analytics-master-001"));
    assert!(hosts.contains("10.0.0.2 analytics-workers-002"));

    let config = s
        .transport
        .file("analytics-master-001", "/etc/cirrus/fake.conf")
        .await
        .unwrap();
    assert!(String::from_utf8(config).unwrap().contains("processes=namenode"));

    let started = s
        .transport
        .calls()
        .await
        .into_iter()
        .filter(|call| format!("{call:?}").contains(STARTED_MARKER))
        .count();
    assert_eq!(started, 3);

    let steps: Vec<String> = cluster
        .provision_progress
        .iter()
        .map(|step| step.step_name.clone())
        .collect();
    assert!(steps.contains(&"Wait for instances to become accessible".to_string()));
    assert!(cluster.provision_progress.iter().all(|s| s.successful != Some(false)));
}

#[tokio::test]
async fn test_not_enough_hosts_fails_before_allocating() {
    let s = stack();
    let cluster = store(&s.db, 3).await;

    s.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.status_description.contains(
        "Not enough free hosts with flavor 'small': requested 3, available 2"
    ));
    assert_eq!(s.engine.free_hosts(None).len(), 3);
}

#[tokio::test]
async fn test_waits_for_host_to_become_accessible() {
    let s = stack();
    let cluster = store(&s.db, 1).await;
    s.transport.set_unreachable("analytics-workers-001").await;
    let transport = s.transport.clone();
    let booting = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        transport.set_reachable("analytics-workers-001").await;
    });

    s.lifecycle.provision(&ctx(), &cluster.id).await;
    booting.await.unwrap();

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(s.engine.hosts_of(&cluster.id), ["h1", "h3"]);
}

#[tokio::test]
async fn test_unreachable_host_rolls_back_creation() {
    let s = stack();
    let cluster = store(&s.db, 2).await;
    s.transport.set_unreachable("analytics-workers-002").await;

    s.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(
        cluster
            .status_description
            .starts_with("Creating cluster failed for the following reason(s): ")
    );
    assert_eq!(cluster.instances().count(), 0);
    assert!(cluster.rollback_info.is_null());
    assert_eq!(s.engine.free_hosts(None).len(), 3);
}

#[tokio::test]
async fn test_failed_scale_up_keeps_cluster_usable() {
    let s = stack();
    let cluster = store(&s.db, 1).await;
    s.lifecycle.provision(&ctx(), &cluster.id).await;
    let workers = cluster.node_groups[1].id.clone();
    s.transport.set_unreachable("analytics-workers-002").await;

    s.lifecycle
        .provision_scaled(&ctx(), &cluster.id, &HashMap::from([(workers, 2)]))
        .await;

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert!(cluster.status_description.starts_with("Scaling cluster failed"));
    assert_eq!(cluster.node_groups[1].count, 1);
    assert_eq!(cluster.instances().count(), 2);
    assert_eq!(s.engine.free_hosts(Some("small")).len(), 1);
}

#[tokio::test]
async fn test_failed_mixed_scaling_keeps_hosts_with_their_instances() {
    let s = stack();
    let cluster = store(&s.db, 1).await;
    s.lifecycle.provision(&ctx(), &cluster.id).await;
    let master = cluster.node_groups[0].id.clone();
    let workers = cluster.node_groups[1].id.clone();

    s.lifecycle
        .provision_scaled(
            &ctx(),
            &cluster.id,
            &HashMap::from([(master, 0), (workers, 3)]),
        )
        .await;

    let cluster = s.db.require_cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert!(cluster.status_description.contains(
        "Not enough free hosts with flavor 'small': requested 2, available 1"
    ));
    let counts: Vec<u32> = cluster.node_groups.iter().map(|ng| ng.count).collect();
    assert_eq!(counts, vec![1, 1]);
    let hosts: Vec<&str> = cluster
        .instances()
        .filter_map(|i| i.instance_id.as_deref())
        .collect();
    assert_eq!(hosts, ["h3", "h1"]);
    assert!(cluster.rollback_info.is_null());
    assert_eq!(s.engine.hosts_of(&cluster.id), ["h1", "h3"]);
    let free: Vec<String> = s.engine.free_hosts(None).into_iter().map(|h| h.name).collect();
    assert_eq!(free, ["h2"]);
}

#[tokio::test]
async fn test_scale_down_and_terminate_release_hosts() {
    let s = stack();
    let cluster = store(&s.db, 2).await;
    s.lifecycle.provision(&ctx(), &cluster.id).await;
    let workers = cluster.node_groups[1].id.clone();

    s.lifecycle
        .provision_scaled(&ctx(), &cluster.id, &HashMap::from([(workers, 1)]))
        .await;
    assert_eq!(s.engine.free_hosts(None).len(), 1);
    let decommissioned = s
        .transport
        .calls()
        .await
        .into_iter()
        .filter(|call| format!("{call:?}").contains("rm -f"))
        .count();
    assert_eq!(decommissioned, 1);

    s.db.update_cluster_status(&cluster.id, ClusterStatus::Deleting, "")
        .await
        .unwrap();
    s.lifecycle.terminate(&ctx(), &cluster.id).await;

    assert!(s.db.get_cluster(&cluster.id).await.unwrap().is_none());
    assert_eq!(s.engine.free_hosts(None).len(), 3);
}

#[tokio::test]
async fn test_quotas_follow_free_hosts() {
    let s = stack();
    let quotas = InventoryQuotas::new(s.engine.clone());

    let limits = quotas.available_limits(&ctx()).await.unwrap();
    assert_eq!(limits.instances, 3);
    assert_eq!(limits.ram, 2048 * 2 + 8192);
    assert_eq!(limits.cpu, 6);

    let cluster = store(&s.db, 2).await;
    s.lifecycle.provision(&ctx(), &cluster.id).await;

    let limits = quotas.available_limits(&ctx()).await.unwrap();
    assert_eq!(limits.instances, 0);
    assert!(quotas.flavor(&ctx(), "tiny").await.is_err());
}

#[tokio::test]
async fn test_open_restores_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.json");
    tokio::fs::write(&path, INVENTORY).await.unwrap();

    let s = stack();
    let cluster = store(&s.db, 1).await;
    s.lifecycle.provision(&ctx(), &cluster.id).await;

    let progress = Arc::new(ProgressTracker::new(s.db.clone()));
    let reopened = InventoryEngine::open(
        &path,
        s.db.clone(),
        RemoteExecutor::new(Arc::new(MockTransport::new())),
        progress,
    )
    .await
    .unwrap();

    assert_eq!(reopened.hosts_of(&cluster.id), ["h1", "h3"]);
    assert_eq!(reopened.free_hosts(None).len(), 1);
}
