// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ops RPC.
//!
//! Operations cross process boundaries as [`RpcEnvelope`]s: the request plus
//! the caller's [`RequestContext`] flattened into a key-value map. A cast is
//! fire-and-forget; a call waits for an [`RpcReply`].
//!
//! Two transports are provided: an in-process channel ([`channel`]) and TCP
//! with length-prefixed JSON frames ([`tcp`]). Both deliver [`Incoming`]
//! messages to the same receiver, which the ops server drains.

pub mod frame;
pub mod tcp;

use std::collections::HashMap;

use async_trait::async_trait;
use cirrus_core::context::RequestContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::OpsRequest;
use frame::FrameError;

/// Errors raised by RPC transports.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The receiving side has gone away.
    #[error("RPC transport closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("RPC encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The server handled the call and reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("RPC call timed out")]
    Timeout,
}

/// Cast or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Cast,
    Call,
}

/// A request in flight between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub kind: CallKind,
    pub context: HashMap<String, Value>,
    pub request: OpsRequest,
}

impl RpcEnvelope {
    pub fn cast(ctx: &RequestContext, request: OpsRequest) -> Self {
        Self {
            kind: CallKind::Cast,
            context: ctx.to_map(),
            request,
        }
    }

    pub fn call(ctx: &RequestContext, request: OpsRequest) -> Self {
        Self {
            kind: CallKind::Call,
            context: ctx.to_map(),
            request,
        }
    }

    /// Re-establish the caller's context.
    pub fn request_context(&self) -> Result<RequestContext, RpcError> {
        Ok(RequestContext::from_map(self.context.clone())?)
    }
}

/// Outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RpcReply {
    Ok { value: Value },
    Err { message: String },
}

impl RpcReply {
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { message } => Err(RpcError::Remote(message)),
        }
    }
}

/// A message delivered to the ops server. Calls carry a reply channel.
#[derive(Debug)]
pub struct Incoming {
    pub envelope: RpcEnvelope,
    pub reply: Option<oneshot::Sender<RpcReply>>,
}

/// Client side of an RPC transport.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Deliver without waiting for the outcome.
    async fn cast(&self, envelope: RpcEnvelope) -> Result<(), RpcError>;

    /// Deliver and wait for the reply.
    async fn call(&self, envelope: RpcEnvelope) -> Result<Value, RpcError>;
}

/// In-process transport backed by a channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<Incoming>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<Incoming>) -> Self {
        Self { sender }
    }

    /// Sender feeding the same receiver, for other listeners.
    pub fn sender(&self) -> mpsc::Sender<Incoming> {
        self.sender.clone()
    }
}

/// Channel transport plus the receiver an ops server drains.
pub fn channel(buffer: usize) -> (ChannelTransport, mpsc::Receiver<Incoming>) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (ChannelTransport::new(sender), receiver)
}

#[async_trait]
impl RpcTransport for ChannelTransport {
    async fn cast(&self, envelope: RpcEnvelope) -> Result<(), RpcError> {
        self.sender
            .send(Incoming {
                envelope,
                reply: None,
            })
            .await
            .map_err(|_| RpcError::Closed)
    }

    async fn call(&self, envelope: RpcEnvelope) -> Result<Value, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Incoming {
                envelope,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        reply_rx.await.map_err(|_| RpcError::Closed)?.into_result()
    }
}
