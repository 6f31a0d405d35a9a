// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request context carried through every operation.
//!
//! A [`RequestContext`] names the identity the orchestrator is acting for.
//! It is passed explicitly as a parameter and cloned (never shared) when a
//! unit of work is spawned, so a child can annotate its own copy without the
//! parent seeing it.
//!
//! Across a process boundary the context travels as a plain key/value map
//! (see [`RequestContext::to_map`] and [`RequestContext::from_map`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity and tenancy of the caller that triggered an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// Correlation id, generated when the context is created.
    pub request_id: String,
    /// Acting user.
    pub user_id: Option<String>,
    /// Tenant (project) owning the resources.
    pub tenant_id: Option<String>,
    /// Bearer token forwarded to provider APIs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Identity endpoint the token was issued by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_uri: Option<String>,
    pub username: Option<String>,
    pub tenant_name: Option<String>,
    pub roles: Vec<String>,
    pub is_admin: bool,
    /// Trust delegated for this cluster, once set up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_id: Option<String>,
    /// Kind of provisioning work in progress, e.g. "Plugin: configure cluster".
    /// Stamped onto provision steps begun under this context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    /// Name of the node the current unit works on, for log correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_instance: Option<String>,
}

impl RequestContext {
    /// Create a context for a user acting within a tenant.
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            user_id: Some(user_id.into()),
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    /// Context used by the service itself (periodic tasks, recovery).
    pub fn admin() -> Self {
        Self {
            request_id: new_request_id(),
            is_admin: true,
            roles: vec!["admin".to_string()],
            ..Self::default()
        }
    }

    /// Builder-style setter for the auth token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Builder-style setter for role names.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Copy of this context scoped to one node.
    pub fn for_instance(&self, instance_name: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.current_instance = Some(instance_name.into());
        ctx
    }

    /// Copy of this context for a phase of the given kind.
    pub fn with_step_type(&self, step_type: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.step_type = Some(step_type.into());
        ctx
    }

    /// Tenant id or an empty string for service-level contexts.
    pub fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or_default()
    }

    /// Serialize into a flat map for transport.
    pub fn to_map(&self) -> HashMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    /// Rebuild a context from a transported map.
    ///
    /// A map without `request_id` gets a fresh one.
    pub fn from_map(map: HashMap<String, Value>) -> Result<Self, serde_json::Error> {
        let mut ctx: Self = serde_json::from_value(Value::Object(map.into_iter().collect()))?;
        if ctx.request_id.is_empty() {
            ctx.request_id = new_request_id();
        }
        Ok(ctx)
    }
}

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}
