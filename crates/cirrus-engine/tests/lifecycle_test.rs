// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster state machine: phase order, failure policy and rollback outcomes.

mod common;

use std::collections::HashMap;

use cirrus_core::model::ClusterStatus;
use cirrus_core::persistence::Persistence;
use common::*;

#[tokio::test]
async fn test_provision_walks_phases_in_order() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("master", 1), ("workers", 2)]).await;

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    assert_eq!(
        h.db.status_history(&cluster.id),
        vec![
            ClusterStatus::InfraUpdating,
            ClusterStatus::Configuring,
            ClusterStatus::Starting,
            ClusterStatus::Active,
        ]
    );
    assert_eq!(h.plugin.calls(), vec!["configure:3", "start:3"]);

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status_description, "");
    assert_eq!(
        cluster.engine_info.unwrap().infrastructure_engine,
        SCRIPTED_ENGINE
    );
    assert_eq!(
        cluster.node_groups[0].image_username.as_deref(),
        Some("root")
    );
}

#[tokio::test]
async fn test_failed_create_without_rollback_ends_in_error() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 2)]).await;
    h.infra.fail_create("no capacity");

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert_eq!(
        cluster.status_description,
        "Creating cluster failed for the following reason(s): Provisioning failed: no capacity"
    );
    assert_eq!(h.infra.calls(), vec!["create", "rollback"]);
    assert!(h.plugin.calls().is_empty());
}

#[tokio::test]
async fn test_successful_rollback_returns_cluster_to_active() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 2)]).await;
    h.infra.fail_create("no capacity");
    h.infra.rollback_returns(true);

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert!(cluster.status_description.contains("no capacity"));
}

#[tokio::test]
async fn test_failed_rollback_records_both_reasons() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 2)]).await;
    h.infra.fail_create("no capacity");
    h.infra.rollback_fails("stuck volume");

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert_eq!(
        cluster.status_description,
        "Creating cluster failed for the following reason(s): \
         Provisioning failed: no capacity, Provisioning failed: stuck volume"
    );
}

#[tokio::test]
async fn test_plugin_failure_is_rolled_back() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 1)]).await;
    h.plugin.fail_configure("bad config");

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    assert_eq!(
        h.db.status_history(&cluster.id),
        vec![
            ClusterStatus::InfraUpdating,
            ClusterStatus::Configuring,
            ClusterStatus::Error,
        ]
    );
    assert_eq!(h.infra.calls(), vec!["create", "rollback"]);
    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert!(cluster.status_description.ends_with("bad config"));
}

#[tokio::test]
async fn test_plugin_failure_with_recovered_infra_returns_to_active() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 2)]).await;
    h.plugin.fail_configure("bad config");
    h.infra.rollback_returns(true);

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    assert_eq!(
        h.db.status_history(&cluster.id),
        vec![
            ClusterStatus::InfraUpdating,
            ClusterStatus::Configuring,
            ClusterStatus::Active,
        ]
    );
    assert_eq!(h.infra.calls(), vec!["create", "rollback"]);
    assert_eq!(h.plugin.calls(), vec!["configure:2"]);

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert!(
        cluster
            .status_description
            .starts_with("Creating cluster failed for the following reason(s): ")
    );
    assert!(cluster.status_description.ends_with("bad config"));
}

#[tokio::test]
async fn test_failure_on_deleting_cluster_is_silent() {
    let h = Harness::new();
    let cluster = h.store_cluster("analytics", &[("workers", 2)]).await;
    h.infra.fail_create("instance vanished");
    h.infra.delete_on_failure();

    h.lifecycle.provision(&ctx(), &cluster.id).await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Deleting);
    assert_eq!(cluster.status_description, "");
    assert_eq!(h.infra.calls(), vec!["create"]);
}

#[tokio::test]
async fn test_missing_cluster_is_a_no_op() {
    let h = Harness::new();

    h.lifecycle.provision(&ctx(), "does-not-exist").await;
    h.lifecycle.terminate(&ctx(), "does-not-exist").await;

    assert!(h.infra.calls().is_empty());
    assert!(h.plugin.calls().is_empty());
}

#[tokio::test]
async fn test_scale_down_decommissions_tail_instances() {
    let h = Harness::new();
    let cluster = h.active_cluster("analytics", &[("workers", 3)]).await;
    let workers = cluster.node_groups[0].id.clone();
    let before = h.db.status_history(&cluster.id).len();

    h.lifecycle
        .provision_scaled(&ctx(), &cluster.id, &HashMap::from([(workers, 1)]))
        .await;

    let history = h.db.status_history(&cluster.id);
    assert_eq!(
        history[before..],
        [
            ClusterStatus::Decommissioning,
            ClusterStatus::Scaling,
            ClusterStatus::Active,
        ]
    );
    assert!(
        h.plugin
            .calls()
            .contains(&"decommission:analytics-workers-1,analytics-workers-2".to_string())
    );

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.node_groups[0].count, 1);
    assert_eq!(cluster.instances().count(), 1);
}

#[tokio::test]
async fn test_scale_up_configures_only_new_instances() {
    let h = Harness::new();
    let cluster = h.active_cluster("analytics", &[("workers", 1)]).await;
    let workers = cluster.node_groups[0].id.clone();
    let before = h.db.status_history(&cluster.id).len();

    h.lifecycle
        .provision_scaled(&ctx(), &cluster.id, &HashMap::from([(workers, 3)]))
        .await;

    assert_eq!(
        h.db.status_history(&cluster.id)[before..],
        [
            ClusterStatus::Decommissioning,
            ClusterStatus::Scaling,
            ClusterStatus::Configuring,
            ClusterStatus::Active,
        ]
    );
    assert_eq!(
        h.plugin.calls().last().unwrap(),
        "scale:analytics-workers-1,analytics-workers-2"
    );
}

#[tokio::test]
async fn test_failed_scaling_uses_scaling_description() {
    let h = Harness::new();
    let cluster = h.active_cluster("analytics", &[("workers", 1)]).await;
    let workers = cluster.node_groups[0].id.clone();
    h.infra.fail_scale("quota gone");
    h.infra.rollback_returns(true);

    h.lifecycle
        .provision_scaled(&ctx(), &cluster.id, &HashMap::from([(workers, 2)]))
        .await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(
        cluster.status_description,
        "Scaling cluster failed for the following reason(s): Provisioning failed: quota gone"
    );
}

#[tokio::test]
async fn test_terminate_removes_cluster() {
    let h = Harness::new();
    let cluster = h.active_cluster("analytics", &[("workers", 2)]).await;
    h.db.update_cluster_status(&cluster.id, ClusterStatus::Deleting, "")
        .await
        .unwrap();

    h.lifecycle.terminate(&ctx(), &cluster.id).await;

    assert!(h.cluster(&cluster.id).await.is_none());
    assert_eq!(h.infra.calls(), vec!["create", "shutdown"]);
    assert_eq!(h.plugin.calls().last().unwrap(), "terminate");
}

#[tokio::test]
async fn test_failed_terminate_leaves_cluster_deleting() {
    let h = Harness::new();
    let cluster = h.active_cluster("analytics", &[("workers", 1)]).await;
    h.db.update_cluster_status(&cluster.id, ClusterStatus::Deleting, "")
        .await
        .unwrap();
    h.infra.fail_shutdown("api down");

    h.lifecycle.terminate(&ctx(), &cluster.id).await;

    let cluster = h.cluster(&cluster.id).await.unwrap();
    assert_eq!(cluster.status, ClusterStatus::Deleting);
    assert!(!h.infra.calls().contains(&"rollback".to_string()));
}
