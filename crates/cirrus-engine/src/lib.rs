// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Engine - cluster lifecycle control service
//!
//! This crate drives big-data clusters through provisioning, scaling and
//! termination on top of the building blocks in `cirrus-core`.
//!
//! # Request flow
//!
//! ```text
//!   client ──► ClusterService ──► Ops ──► (RPC) ──► OpsServer ──► LocalOps
//!              validation,          │                                │
//!              quotas               └──────── in process ────────────┤
//!                                                                    ▼
//!                                                           ClusterLifecycle
//!                                                       plugin ◄──┴──► infra
//! ```
//!
//! [`service::ClusterService`] validates requests synchronously and returns.
//! The work itself runs in the background; its outcome is visible only
//! through the cluster's status, status description and provision events.
//!
//! # Cluster statuses
//!
//! | Operation | Statuses |
//! |-----------|----------|
//! | create | `Validating` → `InfraUpdating` → `Spawning` → `Waiting` → `Preparing` → `Configuring` → `Starting` → `Active` |
//! | scale | `Validating` → `Decommissioning` → `Scaling` → `Configuring` → `Active` |
//! | delete | `Deleting` → removed |
//!
//! A failed operation ends in `Active` when the infrastructure engine could
//! roll it back and in `Error` otherwise.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`lifecycle`] | Cluster state machine and failure policy |
//! | [`dispatcher`] | `Ops` trait, local and RPC dispatch, ops server |
//! | [`rpc`] | Envelopes, channel and TCP transports |
//! | [`service`] | Validated entry points for clusters and jobs |
//! | [`jobs`] | Job execution coordination |
//! | [`verification`] | Cluster health checks |
//! | [`trusts`] | Credential delegation for background work |
//! | [`inventory`] | Infrastructure engine over a static host inventory |
//! | [`plugins`] | Built-in provisioning plugins |
//! | [`runtime`] | Embeddable runtime |
//! | [`config`] | Environment configuration |

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod jobs;
pub mod lifecycle;
pub mod plugins;
pub mod rpc;
pub mod runtime;
pub mod service;
pub mod trusts;
pub mod verification;

pub use config::Config;
pub use dispatcher::{LocalOps, Ops, OpsRequest, RemoteOps};
pub use error::{ProvisioningError, Result};
pub use lifecycle::ClusterLifecycle;
pub use runtime::EngineRuntime;
pub use service::ClusterService;
