//! CAN frame model
//!
//! A [`Frame`] is immutable once built. Identifiers at or above [`SYSTEM_MSG`]
//! never appear on a bus; they carry adapter-internal control and status
//! events over the same channels as bus traffic.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Largest payload carried by a frame (CAN FD)
pub const MAX_DATA_LEN: usize = 64;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// First reserved identifier. Every real bus identifier is below it.
pub const SYSTEM_MSG: u32 = 0x4000_0000;
/// Asynchronous adapter fault, payload is UTF-8 text
pub const SYSTEM_MSG_ERROR: u32 = SYSTEM_MSG + 1;
/// Request for adapter-local data
pub const SYSTEM_MSG_DATA_REQUEST: u32 = SYSTEM_MSG + 2;
/// Reply to a data request
pub const SYSTEM_MSG_DATA_RESPONSE: u32 = SYSTEM_MSG + 3;
/// Acknowledgement of a write request
pub const SYSTEM_MSG_WRITE_RESPONSE: u32 = SYSTEM_MSG + 4;
/// Raw command, written verbatim in the protocol's command framing
pub const SYSTEM_MSG_COMMAND: u32 = SYSTEM_MSG + 5;
/// Informational adapter text (banners, firmware version)
pub const SYSTEM_MSG_INFO: u32 = SYSTEM_MSG + 6;
/// Acceptance filter update, payload is a list of u32 big-endian ids
pub const SYSTEM_MSG_FILTER: u32 = SYSTEM_MSG + 7;

/// Direction and response expectation of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Received from the bus
    #[default]
    Incoming,
    /// To be sent, no response expected
    Outgoing,
    /// To be sent, the caller expects `responses` replies
    OutgoingResponseRequired,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Incoming => 0,
            FrameKind::Outgoing => 1,
            FrameKind::OutgoingResponseRequired => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Incoming),
            1 => Some(FrameKind::Outgoing),
            2 => Some(FrameKind::OutgoingResponseRequired),
            _ => None,
        }
    }
}

/// Frame kind plus the number of expected responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameType {
    pub kind: FrameKind,
    pub responses: u32,
}

impl FrameType {
    pub const INCOMING: FrameType = FrameType {
        kind: FrameKind::Incoming,
        responses: 0,
    };

    pub const OUTGOING: FrameType = FrameType {
        kind: FrameKind::Outgoing,
        responses: 0,
    };

    /// Outgoing frame that expects `responses` replies
    pub fn response_required(responses: u32) -> Self {
        Self {
            kind: FrameKind::OutgoingResponseRequired,
            responses,
        }
    }
}

/// One CAN message (or a reserved system message)
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    data: Bytes,
    frame_type: FrameType,
    extended: bool,
    rtr: bool,
}

impl Frame {
    /// Build a frame. Identifiers above the 11-bit range are marked extended.
    pub fn new(id: u32, data: impl Into<Bytes>, frame_type: FrameType) -> Self {
        Self {
            id,
            data: data.into(),
            frame_type,
            extended: id > MAX_STANDARD_ID && id < SYSTEM_MSG,
            rtr: false,
        }
    }

    pub fn incoming(id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(id, data, FrameType::INCOMING)
    }

    pub fn outgoing(id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(id, data, FrameType::OUTGOING)
    }

    /// Remote transmission request with no payload
    pub fn remote(id: u32, extended: bool, frame_type: FrameType) -> Self {
        Self {
            id,
            data: Bytes::new(),
            frame_type,
            extended,
            rtr: true,
        }
    }

    /// Force the identifier format (e.g. an extended frame with a small id)
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Synthetic fault report on [`SYSTEM_MSG_ERROR`]
    pub fn system_error(text: impl fmt::Display) -> Self {
        Self::new(
            SYSTEM_MSG_ERROR,
            Bytes::from(text.to_string()),
            FrameType::INCOMING,
        )
    }

    /// Informational text on [`SYSTEM_MSG_INFO`]
    pub fn system_info(text: impl fmt::Display) -> Self {
        Self::new(
            SYSTEM_MSG_INFO,
            Bytes::from(text.to_string()),
            FrameType::INCOMING,
        )
    }

    /// Acceptance filter update on [`SYSTEM_MSG_FILTER`]
    pub fn filter_update(ids: &[u32]) -> Self {
        let payload: Vec<u8> = ids.iter().flat_map(|id| id.to_be_bytes()).collect();
        Self::new(SYSTEM_MSG_FILTER, payload, FrameType::OUTGOING)
    }

    /// Identifiers carried by a filter update, `None` for other frames or a ragged payload
    pub fn filter_ids(&self) -> Option<Vec<u32>> {
        if self.id != SYSTEM_MSG_FILTER || self.data.len() % 4 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the payload buffer
    pub fn payload(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_remote(&self) -> bool {
        self.rtr
    }

    /// True for reserved adapter-internal identifiers
    pub fn is_system(&self) -> bool {
        self.id >= SYSTEM_MSG
    }

    /// Payload as lossy UTF-8, for system frames carrying text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &format_args!("0x{:X}", self.id))
            .field("data", &format_args!("{}", HexBytes(&self.data)))
            .field("frame_type", &self.frame_type)
            .field("extended", &self.extended)
            .field("rtr", &self.rtr)
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{:08X}", self.id)?;
        } else {
            write!(f, "0x{:03X}", self.id)?;
        }
        if self.rtr {
            return write!(f, " [R]");
        }
        write!(f, " [{}] {}", self.data.len(), HexBytes(&self.data))
    }
}

struct HexBytes<'a>(&'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extended_inferred_from_id() {
        assert!(!Frame::incoming(0x7FF, vec![1]).is_extended());
        assert!(Frame::incoming(0x800, vec![1]).is_extended());
        assert!(!Frame::system_error("boom").is_extended());
    }

    #[test]
    fn test_system_ids_above_bus_range() {
        assert!(SYSTEM_MSG > MAX_EXTENDED_ID);
        assert!(Frame::system_error("x").is_system());
        assert!(!Frame::incoming(MAX_EXTENDED_ID, vec![]).is_system());
    }

    #[test]
    fn test_display() {
        let frame = Frame::incoming(0x7E8, vec![0x02, 0x50, 0x01]);
        assert_eq!(frame.to_string(), "0x7E8 [3] 02 50 01");
        let remote = Frame::remote(0x1234, true, FrameType::OUTGOING);
        assert_eq!(remote.to_string(), "0x00001234 [R]");
    }

    #[test]
    fn test_filter_update_payload() {
        let frame = Frame::filter_update(&[0x7E8, 0x18DA_F110]);
        assert!(frame.is_system());
        assert_eq!(frame.data(), &[0, 0, 0x07, 0xE8, 0x18, 0xDA, 0xF1, 0x10]);
        assert_eq!(frame.filter_ids(), Some(vec![0x7E8, 0x18DA_F110]));
        assert_eq!(Frame::filter_update(&[]).filter_ids(), Some(vec![]));
        assert_eq!(Frame::incoming(0x7E8, vec![0; 4]).filter_ids(), None);
    }

    #[test]
    fn test_frame_kind_byte_mapping() {
        for kind in [
            FrameKind::Incoming,
            FrameKind::Outgoing,
            FrameKind::OutgoingResponseRequired,
        ] {
            assert_eq!(FrameKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(9), None);
    }
}
