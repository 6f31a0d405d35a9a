// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records describing clusters and their provisioning history.
//!
//! These are plain typed structs. Free-form metadata lives in explicit
//! `extra` maps instead of on the records themselves.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Lifecycle status persisted on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    Validating,
    InfraUpdating,
    Spawning,
    Waiting,
    Preparing,
    Configuring,
    Starting,
    Active,
    Decommissioning,
    Scaling,
    Deleting,
    Error,
}

impl ClusterStatus {
    /// Name as stored and shown to users.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::InfraUpdating => "InfraUpdating",
            Self::Spawning => "Spawning",
            Self::Waiting => "Waiting",
            Self::Preparing => "Preparing",
            Self::Configuring => "Configuring",
            Self::Starting => "Starting",
            Self::Active => "Active",
            Self::Decommissioning => "Decommissioning",
            Self::Scaling => "Scaling",
            Self::Deleting => "Deleting",
            Self::Error => "Error",
        }
    }

    /// True for statuses no further operation moves the cluster out of on
    /// its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Error | Self::Deleting)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "Validating" => Self::Validating,
            "InfraUpdating" => Self::InfraUpdating,
            "Spawning" => Self::Spawning,
            "Waiting" => Self::Waiting,
            "Preparing" => Self::Preparing,
            "Configuring" => Self::Configuring,
            "Starting" => Self::Starting,
            "Active" => Self::Active,
            "Decommissioning" => Self::Decommissioning,
            "Scaling" => Self::Scaling,
            "Deleting" => Self::Deleting,
            "Error" => Self::Error,
            other => {
                return Err(CoreError::ValidationError {
                    field: "status".to_string(),
                    message: format!("unknown cluster status '{other}'"),
                });
            }
        };
        Ok(status)
    }
}

/// Identity of the infrastructure engine and remote transport a cluster was
/// provisioned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub infrastructure_engine: String,
    pub remote: String,
}

/// A provisioned (or provisioning) node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Control-plane id.
    pub id: String,
    /// Owning node group, lookup only.
    pub node_group_id: String,
    /// Provider-side id.
    pub instance_id: Option<String>,
    pub instance_name: String,
    pub internal_ip: Option<String>,
    pub management_ip: Option<String>,
}

impl Instance {
    /// Address used to reach the node from the control plane.
    pub fn access_address(&self) -> Option<&str> {
        self.management_ip
            .as_deref()
            .or(self.internal_ip.as_deref())
    }
}

/// Homogeneous set of instances inside a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub id: String,
    pub name: String,
    pub flavor_id: String,
    /// Desired instance count.
    pub count: u32,
    pub node_processes: Vec<String>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    /// Login user of the image, filled in when provisioning starts.
    #[serde(default)]
    pub image_username: Option<String>,
    #[serde(default)]
    pub floating_ip_pool: Option<String>,
    #[serde(default)]
    pub volumes_per_node: u32,
    /// Size of each volume in GB.
    #[serde(default)]
    pub volumes_size: u32,
    #[serde(default)]
    pub auto_security_group: bool,
    #[serde(default)]
    pub open_ports: Vec<u16>,
}

impl NodeGroup {
    /// Node group with just the required fields set.
    pub fn new(name: impl Into<String>, flavor_id: impl Into<String>, count: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            flavor_id: flavor_id.into(),
            count,
            node_processes: Vec::new(),
            instances: Vec::new(),
            image_username: None,
            floating_ip_pool: None,
            volumes_per_node: 0,
            volumes_size: 0,
            auto_security_group: false,
            open_ports: Vec::new(),
        }
    }
}

/// A cluster and everything the control plane knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub plugin_name: String,
    pub plugin_version: String,
    pub node_groups: Vec<NodeGroup>,
    pub status: ClusterStatus,
    pub status_description: String,
    /// Engine-private bookkeeping used to undo a failed operation.
    #[serde(default)]
    pub rollback_info: Value,
    #[serde(default)]
    pub engine_info: Option<EngineInfo>,
    #[serde(default)]
    pub trust_id: Option<String>,
    /// Ordered by creation.
    #[serde(default)]
    pub provision_progress: Vec<ProvisionStep>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// New cluster in `Validating` status.
    pub fn new(
        name: impl Into<String>,
        tenant_id: impl Into<String>,
        plugin_name: impl Into<String>,
        plugin_version: impl Into<String>,
        node_groups: Vec<NodeGroup>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            tenant_id: tenant_id.into(),
            plugin_name: plugin_name.into(),
            plugin_version: plugin_version.into(),
            node_groups,
            status: ClusterStatus::Validating,
            status_description: String::new(),
            rollback_info: Value::Null,
            engine_info: None,
            trust_id: None,
            provision_progress: Vec::new(),
            extra: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// All instances across node groups, in node group order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.node_groups.iter().flat_map(|ng| ng.instances.iter())
    }

    pub fn node_group(&self, node_group_id: &str) -> Option<&NodeGroup> {
        self.node_groups.iter().find(|ng| ng.id == node_group_id)
    }

    pub fn node_group_mut(&mut self, node_group_id: &str) -> Option<&mut NodeGroup> {
        self.node_groups.iter_mut().find(|ng| ng.id == node_group_id)
    }

    /// Sum of desired counts.
    pub fn total_count(&self) -> u32 {
        self.node_groups.iter().map(|ng| ng.count).sum()
    }
}

/// A named provisioning phase tracked by its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionStep {
    pub id: String,
    pub cluster_id: String,
    pub step_name: String,
    pub step_type: String,
    /// Number of events expected.
    pub total: u32,
    /// Events recorded so far, as of the last refresh.
    pub completed: u32,
    /// `None` until `completed` first reaches `total`.
    pub successful: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl ProvisionStep {
    pub fn is_terminal(&self) -> bool {
        self.successful.is_some()
    }
}

/// One outcome recorded against a provision step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: String,
    pub step_id: String,
    pub cluster_id: String,
    pub node_group_id: Option<String>,
    pub instance_id: Option<String>,
    pub instance_name: Option<String>,
    pub event_info: String,
    pub successful: bool,
    pub created_at: DateTime<Utc>,
}

/// Status of a data-processing job run on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Suspended,
    ToBeKilled,
    Killed,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::ToBeKilled => "TOBEKILLED",
            Self::Killed => "KILLED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Job reached an end state and will not change again.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Killed | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUSPENDED" => Ok(Self::Suspended),
            "TOBEKILLED" => Ok(Self::ToBeKilled),
            "KILLED" => Ok(Self::Killed),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown job status '{other}'"),
            }),
        }
    }
}

/// A job submitted to run on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub cluster_id: String,
    pub tenant_id: String,
    pub status: JobStatus,
    /// Id assigned by the job engine once launched.
    pub engine_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn new(cluster_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.into(),
            tenant_id: tenant_id.into(),
            status: JobStatus::Pending,
            engine_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
