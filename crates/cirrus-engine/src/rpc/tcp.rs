// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP transport for ops RPC.
//!
//! One connection per request. A cast writes a single `Cast` frame; a call
//! writes a `Call` frame and reads back one `Reply` frame.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use super::{Incoming, RpcEnvelope, RpcError, RpcReply, RpcTransport};

/// Default time a call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Client side of the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: SocketAddr,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream, RpcError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(FrameError::from)?;
        stream.set_nodelay(true).map_err(FrameError::from)?;
        Ok(stream)
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn cast(&self, envelope: RpcEnvelope) -> Result<(), RpcError> {
        let mut stream = self.connect().await?;
        let frame = Frame::new(MessageType::Cast, &envelope)?;
        write_frame(&mut stream, &frame).await?;
        Ok(())
    }

    async fn call(&self, envelope: RpcEnvelope) -> Result<Value, RpcError> {
        let exchange = async {
            let mut stream = self.connect().await?;
            let frame = Frame::new(MessageType::Call, &envelope)?;
            write_frame(&mut stream, &frame).await?;

            let reply = read_frame(&mut stream).await?;
            if reply.message_type != MessageType::Reply {
                return Err(RpcError::Frame(FrameError::InvalidMessageType(
                    reply.message_type as u16,
                )));
            }
            reply.decode::<RpcReply>()?.into_result()
        };

        tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout)?
    }
}

/// Accept connections and forward their requests to `sink` until `shutdown`
/// flips to `true`.
pub async fn serve(
    listener: TcpListener,
    sink: mpsc::Sender<Incoming>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Ops RPC listener started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Ops RPC listener received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let sink = sink.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, sink).await {
                                warn!(peer = %peer, error = %e, "Ops RPC connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept ops RPC connection");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    sink: mpsc::Sender<Incoming>,
) -> Result<(), RpcError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match frame.message_type {
            MessageType::Cast => {
                let envelope: RpcEnvelope = frame.decode()?;
                debug!(method = envelope.request.method(), "Received cast");
                sink.send(Incoming {
                    envelope,
                    reply: None,
                })
                .await
                .map_err(|_| RpcError::Closed)?;
            }
            MessageType::Call => {
                let reply = match frame.decode::<RpcEnvelope>() {
                    Ok(envelope) => {
                        debug!(method = envelope.request.method(), "Received call");
                        let (reply_tx, reply_rx) = oneshot::channel();
                        sink.send(Incoming {
                            envelope,
                            reply: Some(reply_tx),
                        })
                        .await
                        .map_err(|_| RpcError::Closed)?;
                        reply_rx.await.map_err(|_| RpcError::Closed)?
                    }
                    Err(e) => RpcReply::Err {
                        message: e.to_string(),
                    },
                };
                write_frame(&mut stream, &Frame::new(MessageType::Reply, &reply)?).await?;
            }
            MessageType::Reply => {
                warn!("Ignoring unexpected reply frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::OpsRequest;
    use cirrus_core::context::RequestContext;

    async fn start_server() -> (SocketAddr, mpsc::Receiver<Incoming>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sink, receiver) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, sink, shutdown_rx));
        (addr, receiver, shutdown_tx)
    }

    #[tokio::test]
    async fn test_cast_reaches_sink() {
        let (addr, mut receiver, _shutdown) = start_server().await;
        let ctx = RequestContext::new("u", "t");

        TcpTransport::new(addr)
            .cast(RpcEnvelope::cast(
                &ctx,
                OpsRequest::ProvisionCluster {
                    cluster_id: "c1".to_string(),
                },
            ))
            .await
            .unwrap();

        let incoming = receiver.recv().await.unwrap();
        assert!(incoming.reply.is_none());
        assert_eq!(
            incoming.envelope.request,
            OpsRequest::ProvisionCluster {
                cluster_id: "c1".to_string()
            }
        );
        assert_eq!(incoming.envelope.request_context().unwrap(), ctx);
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (addr, mut receiver, _shutdown) = start_server().await;
        tokio::spawn(async move {
            while let Some(incoming) = receiver.recv().await {
                if let Some(reply) = incoming.reply {
                    let _ = reply.send(RpcReply::Ok {
                        value: Value::String("inventory.1.0".to_string()),
                    });
                }
            }
        });

        let value = TcpTransport::new(addr)
            .call(RpcEnvelope::call(
                &RequestContext::admin(),
                OpsRequest::GetEngineTypeAndVersion,
            ))
            .await
            .unwrap();
        assert_eq!(value, "inventory.1.0");
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let (addr, mut receiver, _shutdown) = start_server().await;
        tokio::spawn(async move {
            while let Some(incoming) = receiver.recv().await {
                if let Some(reply) = incoming.reply {
                    let _ = reply.send(RpcReply::Err {
                        message: "engine unavailable".to_string(),
                    });
                }
            }
        });

        let err = TcpTransport::new(addr)
            .call(RpcEnvelope::call(
                &RequestContext::admin(),
                OpsRequest::GetEngineTypeAndVersion,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote(m) if m == "engine unavailable"));
    }

    #[tokio::test]
    async fn test_call_times_out_without_reply() {
        let (addr, mut receiver, _shutdown) = start_server().await;
        // Hold the reply sender without answering.
        let holder = tokio::spawn(async move {
            let incoming = receiver.recv().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(incoming);
        });

        let err = TcpTransport::new(addr)
            .with_call_timeout(Duration::from_millis(100))
            .call(RpcEnvelope::call(
                &RequestContext::admin(),
                OpsRequest::GetEngineTypeAndVersion,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        holder.abort();
    }
}
