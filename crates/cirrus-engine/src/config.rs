// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Cirrus engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Address of the ops RPC listener
    pub rpc_addr: SocketAddr,
    /// Upper bound on concurrently running units in one task group
    pub max_concurrent_units: usize,
    /// Upper bound on concurrently open remote sessions
    pub remote_threshold: usize,
    /// Count security group rules and ports the neutron way
    pub use_neutron: bool,
    /// Count floating IPs for node groups with a pool
    pub use_floating_ips: bool,
    /// How long to wait for a job to be killed
    pub job_canceling_timeout: Duration,
    /// Host inventory file for the inventory engine
    pub inventory_path: PathBuf,
    /// Login user for SSH sessions
    pub ssh_user: String,
    /// Private key for SSH sessions
    pub ssh_key_path: Option<PathBuf>,
    /// Skip recording provision steps and events
    pub disable_event_log: bool,
    /// Run health checks after provisioning and on request
    pub enable_verifications: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CIRRUS_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CIRRUS_RPC_PORT`: ops RPC port (default: 8387)
    /// - `CIRRUS_MAX_CONCURRENT_UNITS`: task group bound (default: 1000)
    /// - `CIRRUS_REMOTE_THRESHOLD`: open remote session bound (default: 100)
    /// - `CIRRUS_USE_NEUTRON`: (default: false)
    /// - `CIRRUS_USE_FLOATING_IPS`: (default: true)
    /// - `CIRRUS_JOB_CANCELING_TIMEOUT_SECS`: (default: 300)
    /// - `CIRRUS_INVENTORY_PATH`: (default: inventory.json)
    /// - `CIRRUS_SSH_USER`: (default: cirrus)
    /// - `CIRRUS_SSH_KEY_PATH`: (default: none, ssh picks its own)
    /// - `CIRRUS_DISABLE_EVENT_LOG`: (default: false)
    /// - `CIRRUS_ENABLE_VERIFICATIONS`: (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CIRRUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CIRRUS_DATABASE_URL"))?;

        let rpc_port: u16 = parse_var("CIRRUS_RPC_PORT", "8387", "must be a valid port number")?;

        let max_concurrent_units: usize = parse_var(
            "CIRRUS_MAX_CONCURRENT_UNITS",
            "1000",
            "must be a positive integer",
        )?;
        if max_concurrent_units == 0 {
            return Err(ConfigError::Invalid(
                "CIRRUS_MAX_CONCURRENT_UNITS",
                "must be a positive integer",
            ));
        }

        let remote_threshold: usize = parse_var(
            "CIRRUS_REMOTE_THRESHOLD",
            "100",
            "must be a positive integer",
        )?;
        if remote_threshold == 0 {
            return Err(ConfigError::Invalid(
                "CIRRUS_REMOTE_THRESHOLD",
                "must be a positive integer",
            ));
        }

        let use_neutron = parse_bool("CIRRUS_USE_NEUTRON", false)?;
        let use_floating_ips = parse_bool("CIRRUS_USE_FLOATING_IPS", true)?;

        let canceling_secs: u64 = parse_var(
            "CIRRUS_JOB_CANCELING_TIMEOUT_SECS",
            "300",
            "must be a number of seconds",
        )?;

        let inventory_path = std::env::var("CIRRUS_INVENTORY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("inventory.json"));

        let ssh_user = std::env::var("CIRRUS_SSH_USER").unwrap_or_else(|_| "cirrus".to_string());
        let ssh_key_path = std::env::var("CIRRUS_SSH_KEY_PATH").ok().map(PathBuf::from);

        Ok(Self {
            database_url,
            rpc_addr: SocketAddr::from(([0, 0, 0, 0], rpc_port)),
            max_concurrent_units,
            remote_threshold,
            use_neutron,
            use_floating_ips,
            job_canceling_timeout: Duration::from_secs(canceling_secs),
            inventory_path,
            ssh_user,
            ssh_key_path,
            disable_event_log: parse_bool("CIRRUS_DISABLE_EVENT_LOG", false)?,
            enable_verifications: parse_bool("CIRRUS_ENABLE_VERIFICATIONS", true)?,
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be true or false")),
        },
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
