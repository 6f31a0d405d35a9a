// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Core - cluster provisioning building blocks
//!
//! This crate holds the pieces the control service composes when it drives a
//! big-data cluster through its lifecycle. Nothing here knows about a specific
//! Hadoop distribution or cloud; those arrive through the [`plugin`] and
//! [`infra`] traits.
//!
//! # Architecture
//!
//! ```text
//!   ClusterService ──► OpsDispatcher ──► ClusterLifecycle        (cirrus-engine)
//!                                              │
//!          ┌──────────────────┬────────────────┼──────────────────┐
//!          ▼                  ▼                ▼                  ▼
//!   QuotaChecker      ProgressTracker   ConcurrencyGroup    Persistence
//!   (quotas)          (progress)        (group)             (persistence)
//!                                              │
//!                                              ▼
//!                                       RemoteExecutor
//!                                       (remote)
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`context`] | Request identity cloned into every spawned unit |
//! | [`group`] | Bounded fan-out with first-failure aggregation |
//! | [`remote`] | Commands and file transfer against one node, session-bounded |
//! | [`model`] | Cluster, node group, instance, step and event records |
//! | [`persistence`] | Storage trait with in-memory and SQLite backends |
//! | [`progress`] | Provision steps and per-instance events |
//! | [`quotas`] | Pre-flight resource limit validation |
//! | [`plugin`] | Distribution plugin interface and registry |
//! | [`infra`] | Infrastructure engine interface |

pub mod context;
pub mod error;
pub mod group;
pub mod infra;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod plugin;
pub mod progress;
pub mod quotas;
pub mod remote;

pub use context::RequestContext;
pub use error::{CoreError, Result};
pub use group::{ConcurrencyGroup, GroupError};
pub use model::{Cluster, ClusterStatus, Instance, NodeGroup};
pub use persistence::Persistence;
pub use progress::ProgressTracker;
pub use remote::RemoteExecutor;
