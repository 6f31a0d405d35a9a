// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for ops RPC over a byte stream.
//!
//! Every message is one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// One-way request, no reply is sent
    Cast = 1,
    /// Request that expects a reply frame
    Call = 2,
    /// Reply to a call
    Reply = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Cast),
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::Reply),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame carrying `msg` as JSON
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        cluster_id: String,
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(
            MessageType::Call,
            &Ping {
                cluster_id: "c1".to_string(),
            },
        )
        .unwrap();
        let encoded = frame.encode();

        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
        assert_eq!(&encoded[4..6], &[0, 2]);

        let decoded = Frame::decode_from_bytes(encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::Call);
        assert_eq!(
            decoded.decode::<Ping>().unwrap(),
            Ping {
                cluster_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_message_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        buf.put_u16(9);

        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageType(9)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u16(1);

        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(1);
        buf.put_slice(b"{}");

        assert!(Frame::decode_from_bytes(buf.freeze()).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new(
            MessageType::Cast,
            &Ping {
                cluster_id: "c2".to_string(),
            },
        )
        .unwrap();

        write_frame(&mut client, &frame).await.unwrap();
        let read = read_frame(&mut server).await.unwrap();
        assert_eq!(read.message_type, MessageType::Cast);
        assert_eq!(read.decode::<Ping>().unwrap().cluster_id, "c2");

        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
