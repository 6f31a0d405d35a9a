// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cirrus-engine.
//!
//! [`EngineRuntime`] wires the collaborators together (persistence, plugins,
//! infrastructure engine, remote executor, quotas, jobs, verifications),
//! starts the ops server and exposes the [`ClusterService`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cirrus_engine::runtime::EngineRuntime;
//!
//! let runtime = EngineRuntime::builder()
//!     .persistence(persistence)
//!     .infra(infra)
//!     .remote(remote)
//!     .quota_provider(quotas)
//!     .plugin(plugin)
//!     .bind_addr("0.0.0.0:8387".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let cluster = runtime.service().create_cluster(&ctx, request).await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cirrus_core::group::DEFAULT_POOL_SIZE;
use cirrus_core::infra::InfraEngine;
use cirrus_core::persistence::Persistence;
use cirrus_core::plugin::{PluginRegistry, ProvisioningPlugin};
use cirrus_core::progress::ProgressTracker;
use cirrus_core::quotas::{NetworkingMode, QuotaChecker, QuotaProvider};
use cirrus_core::remote::RemoteExecutor;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::{LocalOps, Ops, OpsServer, RemoteOps};
use crate::jobs::{DEFAULT_CANCELING_TIMEOUT, JobCoordinator, JobEngine};
use crate::lifecycle::ClusterLifecycle;
use crate::rpc::{self, ChannelTransport, tcp};
use crate::service::ClusterService;
use crate::trusts::{NoTrusts, TrustManager};
use crate::verification::{DisabledVerifier, HealthVerifier, InstanceHealthVerifier};

/// Capacity of the in-process ops channel.
const OPS_CHANNEL_CAPACITY: usize = 1024;

/// How long shutdown waits for running operations.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    infra: Option<Arc<dyn InfraEngine>>,
    remote: Option<RemoteExecutor>,
    quota_provider: Option<Arc<dyn QuotaProvider>>,
    plugins: PluginRegistry,
    progress: Option<Arc<ProgressTracker>>,
    job_engine: Option<Arc<dyn JobEngine>>,
    verifier: Option<Arc<dyn HealthVerifier>>,
    trusts: Arc<dyn TrustManager>,
    networking: NetworkingMode,
    job_canceling_timeout: Duration,
    enable_verifications: bool,
    max_concurrent_units: usize,
    bind_addr: Option<SocketAddr>,
    dispatch_over_rpc: bool,
    drain_timeout: Duration,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field(
                "infra",
                &self.infra.as_ref().map(|infra| infra.type_and_version()),
            )
            .field("plugins", &self.plugins.names())
            .field("bind_addr", &self.bind_addr)
            .field("dispatch_over_rpc", &self.dispatch_over_rpc)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            infra: None,
            remote: None,
            quota_provider: None,
            plugins: PluginRegistry::new(),
            progress: None,
            job_engine: None,
            verifier: None,
            trusts: Arc::new(NoTrusts),
            networking: NetworkingMode::default(),
            job_canceling_timeout: DEFAULT_CANCELING_TIMEOUT,
            enable_verifications: true,
            max_concurrent_units: DEFAULT_POOL_SIZE,
            bind_addr: None,
            dispatch_over_rpc: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.networking = NetworkingMode {
            use_neutron: config.use_neutron,
            use_floating_ips: config.use_floating_ips,
        };
        self.job_canceling_timeout = config.job_canceling_timeout;
        self.enable_verifications = config.enable_verifications;
        self.max_concurrent_units = config.max_concurrent_units;
        self.bind_addr = Some(config.rpc_addr);
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the infrastructure engine (required).
    pub fn infra(mut self, infra: Arc<dyn InfraEngine>) -> Self {
        self.infra = Some(infra);
        self
    }

    /// Set the remote executor (required).
    pub fn remote(mut self, remote: RemoteExecutor) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Set the source of flavors and available quota (required).
    pub fn quota_provider(mut self, provider: Arc<dyn QuotaProvider>) -> Self {
        self.quota_provider = Some(provider);
        self
    }

    /// Register a provisioning plugin.
    pub fn plugin(mut self, plugin: Arc<dyn ProvisioningPlugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    /// Share a progress tracker with components built outside the runtime.
    ///
    /// Default: a tracker over the configured persistence.
    pub fn progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Enable job executions.
    pub fn job_engine(mut self, engine: Arc<dyn JobEngine>) -> Self {
        self.job_engine = Some(engine);
        self
    }

    /// Replace the health verifier.
    ///
    /// Default: instance reachability probes, or none when verifications are
    /// disabled.
    pub fn verifier(mut self, verifier: Arc<dyn HealthVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn trusts(mut self, trusts: Arc<dyn TrustManager>) -> Self {
        self.trusts = trusts;
        self
    }

    pub fn networking(mut self, networking: NetworkingMode) -> Self {
        self.networking = networking;
        self
    }

    pub fn job_canceling_timeout(mut self, timeout: Duration) -> Self {
        self.job_canceling_timeout = timeout;
        self
    }

    pub fn enable_verifications(mut self, enabled: bool) -> Self {
        self.enable_verifications = enabled;
        self
    }

    pub fn max_concurrent_units(mut self, units: usize) -> Self {
        self.max_concurrent_units = units;
        self
    }

    /// Accept ops RPC over TCP on this address.
    ///
    /// Default: no TCP listener.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Route the service's operations through the RPC channel instead of
    /// spawning them directly.
    pub fn dispatch_over_rpc(mut self, enabled: bool) -> Self {
        self.dispatch_over_rpc = enabled;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let infra = self
            .infra
            .ok_or_else(|| anyhow::anyhow!("infrastructure engine is required"))?;
        let remote = self
            .remote
            .ok_or_else(|| anyhow::anyhow!("remote executor is required"))?;
        let quota_provider = self
            .quota_provider
            .ok_or_else(|| anyhow::anyhow!("quota provider is required"))?;
        if self.plugins.names().is_empty() {
            anyhow::bail!("at least one plugin is required");
        }

        let progress = self
            .progress
            .unwrap_or_else(|| Arc::new(ProgressTracker::new(persistence.clone())));
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None if self.enable_verifications => Arc::new(
                InstanceHealthVerifier::new(persistence.clone(), remote.clone())
                    .with_pool_size(self.max_concurrent_units),
            ),
            None => Arc::new(DisabledVerifier),
        };

        Ok(EngineRuntimeConfig {
            persistence,
            infra,
            remote,
            quota_provider,
            plugins: self.plugins,
            progress,
            job_engine: self.job_engine,
            verifier,
            trusts: self.trusts,
            networking: self.networking,
            job_canceling_timeout: self.job_canceling_timeout,
            bind_addr: self.bind_addr,
            dispatch_over_rpc: self.dispatch_over_rpc,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    infra: Arc<dyn InfraEngine>,
    remote: RemoteExecutor,
    quota_provider: Arc<dyn QuotaProvider>,
    plugins: PluginRegistry,
    progress: Arc<ProgressTracker>,
    job_engine: Option<Arc<dyn JobEngine>>,
    verifier: Arc<dyn HealthVerifier>,
    trusts: Arc<dyn TrustManager>,
    networking: NetworkingMode,
    job_canceling_timeout: Duration,
    bind_addr: Option<SocketAddr>,
    dispatch_over_rpc: bool,
    drain_timeout: Duration,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("infra", &self.infra.type_and_version())
            .field("remote", &self.remote.type_and_version())
            .field("plugins", &self.plugins.names())
            .field("jobs", &self.job_engine.is_some())
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the ops server and the optional TCP
    /// listener.
    pub async fn start(self) -> Result<EngineRuntime> {
        let mut lifecycle = ClusterLifecycle::new(
            self.persistence.clone(),
            self.plugins.clone(),
            self.infra.clone(),
            self.remote.clone(),
        )
        .with_progress(self.progress.clone())
        .with_trusts(self.trusts.clone())
        .with_verifier(self.verifier.clone());
        if let Some(engine) = self.job_engine {
            lifecycle = lifecycle.with_jobs(Arc::new(
                JobCoordinator::new(self.persistence.clone(), engine)
                    .with_canceling_timeout(self.job_canceling_timeout),
            ));
        }
        let local = LocalOps::new(Arc::new(lifecycle));

        let (transport, receiver) = rpc::channel(OPS_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(
            OpsServer::new(local.clone()).run(receiver, shutdown_rx.clone()),
        );

        let (listener_handle, rpc_addr) = match self.bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                let handle = tokio::spawn(tcp::serve(listener, transport.sender(), shutdown_rx));
                (Some(handle), Some(local_addr))
            }
            None => (None, None),
        };

        let ops: Arc<dyn Ops> = if self.dispatch_over_rpc {
            Arc::new(RemoteOps::new(Arc::new(transport.clone())))
        } else {
            Arc::new(local.clone())
        };
        let service = ClusterService::new(
            self.persistence.clone(),
            self.plugins,
            QuotaChecker::new(self.quota_provider, self.networking),
            ops,
        )
        .with_verifier(self.verifier);

        info!(
            infra = %self.infra.type_and_version(),
            remote = %self.remote.type_and_version(),
            rpc_addr = ?rpc_addr,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            service: Arc::new(service),
            local,
            transport,
            persistence: self.persistence,
            progress: self.progress,
            server_handle,
            listener_handle,
            shutdown_tx,
            rpc_addr,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// A running cirrus engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    service: Arc<ClusterService>,
    local: LocalOps,
    transport: ChannelTransport,
    persistence: Arc<dyn Persistence>,
    progress: Arc<ProgressTracker>,
    server_handle: JoinHandle<Result<()>>,
    listener_handle: Option<JoinHandle<Result<()>>>,
    shutdown_tx: watch::Sender<bool>,
    rpc_addr: Option<SocketAddr>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("rpc_addr", &self.rpc_addr)
            .field("ops", &self.local)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    pub fn service(&self) -> &Arc<ClusterService> {
        &self.service
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Ops client over the in-process RPC channel.
    pub fn rpc_client(&self) -> RemoteOps {
        RemoteOps::new(Arc::new(self.transport.clone()))
    }

    /// Address of the TCP listener, if one was requested.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    /// Number of dispatched operations still running.
    pub fn in_flight(&self) -> usize {
        self.local.in_flight()
    }

    /// Wait until every dispatched operation has finished.
    pub async fn wait_idle(&self) {
        self.local.wait_idle().await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting requests, then waits up to the drain timeout for
    /// running operations.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        if let Some(listener) = self.listener_handle {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Ops RPC listener error during shutdown: {}", e),
                Err(e) => warn!("Ops RPC listener task panicked: {}", e),
            }
        }

        let served = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("EngineRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        if tokio::time::timeout(self.drain_timeout, self.local.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.local.in_flight(),
                "Operations still running after drain timeout"
            );
        }

        match served {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("EngineRuntime server error during shutdown: {}", e);
                Err(e)
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_persistence() {
        let err = EngineRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("persistence"));
    }
}
