//! Gateway wire format
//!
//! Every message is `type: u8, len: u32 LE, payload[len]`. Frames use a fixed
//! little-endian header:
//!
//! ```text
//! id u32 | kind u8 | responses u32 | flags u8 | len u16 | data[len]
//! ```
//!
//! Hello, discovery replies and port lists are JSON.

use std::collections::BTreeMap;

use canlink_core::{AdapterInfo, Frame, FrameKind, FrameType, PortInfo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, GatewayResult};

pub const MSG_HELLO: u8 = 1;
pub const MSG_FRAME: u8 = 2;
pub const MSG_COMMAND: u8 = 3;
pub const MSG_COMMAND_REPLY: u8 = 4;
pub const MSG_LIST_ADAPTERS: u8 = 5;
pub const MSG_ADAPTERS: u8 = 6;
pub const MSG_LIST_PORTS: u8 = 7;
pub const MSG_PORTS: u8 = 8;

pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
pub const FRAME_HDR_LEN: usize = 12;

const FLAG_EXTENDED: u8 = 1 << 0;
const FLAG_REMOTE: u8 = 1 << 1;

/// One gateway message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Session metadata; opens a streaming session
    Hello(BTreeMap<String, String>),
    Frame(Frame),
    Command(Vec<u8>),
    CommandReply(Vec<u8>),
    ListAdapters,
    Adapters(Vec<AdapterInfo>),
    ListPorts,
    Ports(Vec<PortInfo>),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Hello(_) => MSG_HELLO,
            Message::Frame(_) => MSG_FRAME,
            Message::Command(_) => MSG_COMMAND,
            Message::CommandReply(_) => MSG_COMMAND_REPLY,
            Message::ListAdapters => MSG_LIST_ADAPTERS,
            Message::Adapters(_) => MSG_ADAPTERS,
            Message::ListPorts => MSG_LIST_PORTS,
            Message::Ports(_) => MSG_PORTS,
        }
    }

    pub fn encode_payload(&self) -> GatewayResult<Vec<u8>> {
        Ok(match self {
            Message::Hello(meta) => serde_json::to_vec(meta)?,
            Message::Frame(frame) => encode_frame(frame)?,
            Message::Command(bytes) | Message::CommandReply(bytes) => bytes.clone(),
            Message::ListAdapters | Message::ListPorts => Vec::new(),
            Message::Adapters(list) => serde_json::to_vec(list)?,
            Message::Ports(list) => serde_json::to_vec(list)?,
        })
    }

    pub fn decode(msg_type: u8, payload: &[u8]) -> GatewayResult<Self> {
        Ok(match msg_type {
            MSG_HELLO => Message::Hello(serde_json::from_slice(payload)?),
            MSG_FRAME => Message::Frame(decode_frame(payload)?),
            MSG_COMMAND => Message::Command(payload.to_vec()),
            MSG_COMMAND_REPLY => Message::CommandReply(payload.to_vec()),
            MSG_LIST_ADAPTERS => Message::ListAdapters,
            MSG_ADAPTERS => Message::Adapters(serde_json::from_slice(payload)?),
            MSG_LIST_PORTS => Message::ListPorts,
            MSG_PORTS => Message::Ports(serde_json::from_slice(payload)?),
            other => return Err(GatewayError::wire(format!("unknown message type {}", other))),
        })
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = msg.encode_payload()?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(GatewayError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(msg.msg_type());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Next message, or `None` when the peer closed the stream between messages
pub async fn read_message<R>(reader: &mut R) -> GatewayResult<Option<Message>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let msg_type = match reader.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(GatewayError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Message::decode(msg_type, &payload).map(Some)
}

pub fn encode_frame(frame: &Frame) -> GatewayResult<Vec<u8>> {
    let len = u16::try_from(frame.len())
        .map_err(|_| GatewayError::wire(format!("frame data of {} bytes", frame.len())))?;
    let frame_type = frame.frame_type();
    let mut flags = 0u8;
    if frame.is_extended() {
        flags |= FLAG_EXTENDED;
    }
    if frame.is_remote() {
        flags |= FLAG_REMOTE;
    }

    let mut out = Vec::with_capacity(FRAME_HDR_LEN + frame.len());
    out.extend_from_slice(&frame.id().to_le_bytes());
    out.push(frame_type.kind.as_u8());
    out.extend_from_slice(&frame_type.responses.to_le_bytes());
    out.push(flags);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(frame.data());
    Ok(out)
}

pub fn decode_frame(payload: &[u8]) -> GatewayResult<Frame> {
    let Some((header, data)) = payload.split_first_chunk::<FRAME_HDR_LEN>() else {
        return Err(GatewayError::wire("invalid frame payload length"));
    };
    let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let kind = FrameKind::from_u8(header[4])
        .ok_or_else(|| GatewayError::wire(format!("invalid frame kind {}", header[4])))?;
    let responses = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
    let flags = header[9];
    let len = u16::from_le_bytes([header[10], header[11]]) as usize;
    if data.len() != len {
        return Err(GatewayError::wire("invalid frame payload length"));
    }

    let frame_type = FrameType { kind, responses };
    let extended = flags & FLAG_EXTENDED != 0;
    if flags & FLAG_REMOTE != 0 {
        return Ok(Frame::remote(id, extended, frame_type));
    }
    Ok(Frame::new(id, data.to_vec(), frame_type).with_extended(extended))
}

/// Readiness sentinel sent once a session's adapter is connected
pub fn ready_sentinel() -> Frame {
    Frame::incoming(SENTINEL_ID, b"OK".to_vec())
}

/// Sentinel carrying the reason a session could not start
pub fn error_sentinel(reason: impl std::fmt::Display) -> Frame {
    Frame::incoming(SENTINEL_ID, reason.to_string().into_bytes())
}

/// Identifier of the session handshake channel
pub const SENTINEL_ID: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use canlink_core::SYSTEM_MSG_ERROR;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_layout() {
        let frame = Frame::new(0x7E0, vec![0x02u8, 0x10, 0x03], FrameType::response_required(2));
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(
            bytes,
            vec![0xE0, 0x07, 0, 0, 2, 2, 0, 0, 0, 0, 3, 0, 0x02, 0x10, 0x03]
        );
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_flags_survive() {
        let extended = Frame::outgoing(0x100, vec![1u8]).with_extended(true);
        assert!(decode_frame(&encode_frame(&extended).unwrap()).unwrap().is_extended());

        let remote = Frame::remote(0x7DF, false, FrameType::OUTGOING);
        let back = decode_frame(&encode_frame(&remote).unwrap()).unwrap();
        assert!(back.is_remote());
        assert!(back.is_empty());
    }

    #[test]
    fn test_long_system_text() {
        let frame = Frame::system_error("x".repeat(600));
        let back = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(back.id(), SYSTEM_MSG_ERROR);
        assert_eq!(back.len(), 600);
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let bytes = encode_frame(&Frame::outgoing(0x7E0, vec![1u8, 2, 3])).unwrap();
        assert!(decode_frame(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_frame(&bytes[..5]).is_err());

        let mut bad_kind = bytes.clone();
        bad_kind[4] = 9;
        assert!(decode_frame(&bad_kind).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_frame_total(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            // Any input is either a frame or an error, never a panic
            let _ = decode_frame(&bytes);
        }
    }

    #[tokio::test]
    async fn test_message_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut meta = BTreeMap::new();
        meta.insert("adapter".to_string(), "Loopback".to_string());

        write_message(&mut a, &Message::Hello(meta.clone())).await.unwrap();
        write_message(&mut a, &Message::Command(b"ping".to_vec())).await.unwrap();
        write_message(&mut a, &Message::ListPorts).await.unwrap();
        drop(a);

        assert_eq!(read_message(&mut b).await.unwrap(), Some(Message::Hello(meta)));
        assert_eq!(
            read_message(&mut b).await.unwrap(),
            Some(Message::Command(b"ping".to_vec()))
        );
        assert_eq!(read_message(&mut b).await.unwrap(), Some(Message::ListPorts));
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![MSG_COMMAND];
        header.extend_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_le_bytes());
        a.write_all(&header).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(GatewayError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x7F, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(GatewayError::Wire(_))));
    }
}
