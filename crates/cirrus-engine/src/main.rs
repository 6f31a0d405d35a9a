// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Engine - cluster lifecycle control service
//!
//! Runs the ops server over a SQLite database, an SSH remote executor, the
//! host inventory engine and the fake plugin. Operations arrive over TCP.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use cirrus_core::persistence::SqlitePersistence;
use cirrus_core::progress::ProgressTracker;
use cirrus_core::remote::{RemoteExecutor, SshTransport};
use cirrus_engine::config::Config;
use cirrus_engine::inventory::{InventoryEngine, InventoryQuotas};
use cirrus_engine::plugins::FakePlugin;
use cirrus_engine::runtime::EngineRuntime;
use cirrus_engine::trusts::LocalTrusts;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cirrus_engine=info".parse()?),
        )
        .init();

    info!("Starting Cirrus Engine");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        rpc_addr = %config.rpc_addr,
        max_units = config.max_concurrent_units,
        remote_threshold = config.remote_threshold,
        inventory = %config.inventory_path.display(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let sqlite = SqlitePersistence::connect(&config.database_url).await?;
    let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(sqlite.pool()).await?;
    info!(result = row.0, "Database health check passed");
    let persistence = Arc::new(sqlite);

    let progress = Arc::new(if config.disable_event_log {
        ProgressTracker::disabled(persistence.clone())
    } else {
        ProgressTracker::new(persistence.clone())
    });

    let mut ssh = SshTransport::new(config.ssh_user.clone());
    if let Some(key) = &config.ssh_key_path {
        ssh = ssh.with_private_key(key);
    }
    let remote = RemoteExecutor::with_session_limit(Arc::new(ssh), config.remote_threshold);

    let inventory = Arc::new(
        InventoryEngine::open(
            &config.inventory_path,
            persistence.clone(),
            remote.clone(),
            progress.clone(),
        )
        .await?
        .with_image_username(config.ssh_user.clone())
        .with_pool_size(config.max_concurrent_units),
    );
    info!(
        hosts = inventory.inventory().hosts.len(),
        free = inventory.free_hosts(None).len(),
        "Inventory loaded"
    );

    let plugin = FakePlugin::new(remote.clone(), progress.clone())
        .with_pool_size(config.max_concurrent_units);

    let runtime = EngineRuntime::builder()
        .config(&config)
        .persistence(persistence.clone())
        .infra(inventory.clone())
        .remote(remote)
        .quota_provider(Arc::new(InventoryQuotas::new(inventory)))
        .plugin(Arc::new(plugin))
        .progress(progress)
        .trusts(Arc::new(LocalTrusts::new(persistence)))
        .build()?
        .start()
        .await?;

    info!("Cirrus Engine initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
