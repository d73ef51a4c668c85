//! Binary framed protocol (CANBridge)
//!
//! Every packet is `command, length, payload[length], checksum` where the
//! checksum is the wrapping sum of every preceding byte of the packet.
//! Decoding is a four-state machine fed one byte at a time; a bad checksum
//! drops that packet only, the next command byte starts a fresh one.

use canlink_core::{Frame, FrameType, MAX_DATA_LEN, MAX_EXTENDED_ID};

use crate::error::{CodecError, CodecResult};
use crate::filter::AcceptanceFilter;

/// Bus frame (device ↔ host)
pub const CMD_FRAME: u8 = 0x10;
/// Asynchronous error text (device → host)
pub const CMD_ERROR: u8 = 0x11;
/// Firmware version query and reply
pub const CMD_VERSION: u8 = 0x20;
pub const CMD_OPEN: u8 = 0x21;
pub const CMD_CLOSE: u8 = 0x22;
/// Bus rate in bit/s as u32 big-endian
pub const CMD_BITRATE: u8 = 0x23;
/// Acceptance filter: code and don't-care mask as u32 big-endian
pub const CMD_FILTER: u8 = 0x24;

const COMMANDS: [u8; 7] = [
    CMD_FRAME,
    CMD_ERROR,
    CMD_VERSION,
    CMD_OPEN,
    CMD_CLOSE,
    CMD_BITRATE,
    CMD_FILTER,
];

/// Longest payload a packet can carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

const EXTENDED_FLAG: u32 = 1 << 31;
const REMOTE_FLAG: u32 = 1 << 30;

pub fn is_command(byte: u8) -> bool {
    COMMANDS.contains(&byte)
}

/// Control replies, as opposed to bus traffic and error text
pub fn is_control(command: u8) -> bool {
    is_command(command) && command != CMD_FRAME && command != CMD_ERROR
}

/// Wrapping sum of command, length and payload
pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(command.wrapping_add(payload.len() as u8), |sum, b| {
            sum.wrapping_add(*b)
        })
}

/// One decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(self.command, &self.payload)
    }
}

/// Frame `payload` under `command`
pub fn encode(command: u8, payload: &[u8]) -> CodecResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLong {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(command);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out.push(checksum(command, payload));
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitCommand,
    ReadLength,
    Accumulate,
    VerifyChecksum,
}

/// Incremental packet decoder
#[derive(Debug)]
pub struct FramedDecoder {
    state: State,
    command: u8,
    expected: usize,
    payload: Vec<u8>,
}

impl Default for FramedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FramedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitCommand,
            command: 0,
            expected: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD),
        }
    }

    /// Advance by one byte; returns a result once a packet is complete
    pub fn push(&mut self, byte: u8) -> Option<CodecResult<Packet>> {
        match self.state {
            State::WaitCommand => {
                // Line noise between packets is skipped
                if !is_command(byte) {
                    return None;
                }
                self.command = byte;
                self.payload.clear();
                self.state = State::ReadLength;
                None
            }
            State::ReadLength => {
                self.expected = byte as usize;
                self.state = if self.expected == 0 {
                    State::VerifyChecksum
                } else {
                    State::Accumulate
                };
                None
            }
            State::Accumulate => {
                self.payload.push(byte);
                if self.payload.len() == self.expected {
                    self.state = State::VerifyChecksum;
                }
                None
            }
            State::VerifyChecksum => {
                self.state = State::WaitCommand;
                let expected = checksum(self.command, &self.payload);
                if byte != expected {
                    return Some(Err(CodecError::ChecksumMismatch {
                        expected,
                        actual: byte,
                    }));
                }
                Some(Ok(Packet {
                    command: self.command,
                    payload: std::mem::take(&mut self.payload),
                }))
            }
        }
    }

    /// Feed a chunk, collecting every completed packet or error in order
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<CodecResult<Packet>>) {
        out.extend(bytes.iter().filter_map(|b| self.push(*b)));
    }
}

/// Frame payload: identifier word (bit 31 extended, bit 30 remote) then data
pub fn encode_frame(frame: &Frame) -> CodecResult<Vec<u8>> {
    if frame.id() > MAX_EXTENDED_ID {
        return Err(CodecError::InvalidId(frame.id()));
    }
    if frame.len() > MAX_DATA_LEN {
        return Err(CodecError::PayloadTooLong {
            len: frame.len(),
            max: MAX_DATA_LEN,
        });
    }
    let mut word = frame.id();
    if frame.is_extended() {
        word |= EXTENDED_FLAG;
    }
    if frame.is_remote() {
        word |= REMOTE_FLAG;
    }
    let mut payload = Vec::with_capacity(4 + frame.len());
    payload.extend_from_slice(&word.to_be_bytes());
    payload.extend_from_slice(frame.data());
    encode(CMD_FRAME, &payload)
}

pub fn decode_frame(payload: &[u8]) -> CodecResult<Frame> {
    if payload.len() < 4 {
        return Err(CodecError::Malformed(format!(
            "frame payload of {} bytes",
            payload.len()
        )));
    }
    let (word, data) = payload.split_at(4);
    let word = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
    let id = word & MAX_EXTENDED_ID;
    let extended = word & EXTENDED_FLAG != 0;
    if data.len() > MAX_DATA_LEN {
        return Err(CodecError::PayloadTooLong {
            len: data.len(),
            max: MAX_DATA_LEN,
        });
    }
    if word & REMOTE_FLAG != 0 {
        return Ok(Frame::remote(id, extended, FrameType::INCOMING));
    }
    Ok(Frame::incoming(id, data.to_vec()).with_extended(extended))
}

pub fn encode_bitrate(kbit: f64) -> CodecResult<Vec<u8>> {
    if !(kbit > 0.0 && kbit <= 8000.0) {
        return Err(CodecError::UnsupportedRate(kbit));
    }
    let bits = (kbit * 1000.0).round() as u32;
    encode(CMD_BITRATE, &bits.to_be_bytes())
}

pub fn encode_filter(filter: &AcceptanceFilter) -> CodecResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&filter.code.to_be_bytes());
    payload.extend_from_slice(&filter.mask.to_be_bytes());
    encode(CMD_FILTER, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::compute_filter;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Vec<CodecResult<Packet>> {
        let mut decoder = FramedDecoder::new();
        let mut out = Vec::new();
        decoder.feed(bytes, &mut out);
        out
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(CMD_FRAME, &[]), 0x10);
        assert_eq!(checksum(CMD_FRAME, &[0xFF, 0xFF]), 0x10u8.wrapping_add(2).wrapping_add(0xFE));
    }

    #[test]
    fn test_zero_length_packet() {
        let bytes = encode(CMD_OPEN, &[]).unwrap();
        assert_eq!(bytes, vec![CMD_OPEN, 0, CMD_OPEN]);
        assert_eq!(decode_all(&bytes), vec![Ok(Packet::new(CMD_OPEN, Vec::<u8>::new()))]);
    }

    #[test]
    fn test_bad_checksum_does_not_desync() {
        let mut bad = encode(CMD_VERSION, b"1.2.0").unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x5A;
        let mut stream = bad;
        stream.extend(encode(CMD_VERSION, b"1.2.0").unwrap());

        let results = decode_all(&stream);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(CodecError::ChecksumMismatch { .. })));
        assert_eq!(results[1], Ok(Packet::new(CMD_VERSION, b"1.2.0".to_vec())));
    }

    #[test]
    fn test_noise_between_packets() {
        let mut stream = vec![0x00, 0xEE];
        stream.extend(encode(CMD_CLOSE, &[]).unwrap());
        stream.extend([0xFF, 0x7F]);
        assert_eq!(
            decode_all(&stream),
            vec![Ok(Packet::new(CMD_CLOSE, Vec::<u8>::new()))]
        );
    }

    #[test]
    fn test_oversize_payload_rejected() {
        assert!(matches!(
            encode(CMD_FRAME, &[0; 256]),
            Err(CodecError::PayloadTooLong { len: 256, max: 255 })
        ));
    }

    #[test]
    fn test_frame_payload() {
        let frame = Frame::outgoing(0x18DA_F110, vec![0x02, 0x3E, 0x00]);
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(&bytes[..6], &[CMD_FRAME, 7, 0x98, 0xDA, 0xF1, 0x10]);

        let packet = decode_all(&bytes).remove(0).unwrap();
        let decoded = decode_frame(&packet.payload).unwrap();
        assert_eq!(decoded.id(), 0x18DA_F110);
        assert!(decoded.is_extended());
        assert_eq!(decoded.data(), frame.data());

        assert!(decode_frame(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_control_packets() {
        assert_eq!(
            encode_bitrate(500.0).unwrap(),
            encode(CMD_BITRATE, &500_000u32.to_be_bytes()).unwrap()
        );
        let filter = encode_filter(&compute_filter(&[0x100, 0x200])).unwrap();
        assert_eq!(&filter[2..10], &[0, 0, 0, 0, 0, 0, 0x03, 0x00]);
        assert!(is_control(CMD_FILTER));
        assert!(!is_control(CMD_FRAME));
        assert!(!is_control(CMD_ERROR));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            command in prop::sample::select(COMMANDS.to_vec()),
            payload in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
        ) {
            let bytes = encode(command, &payload).unwrap();
            let results = decode_all(&bytes);
            prop_assert_eq!(results, vec![Ok(Packet::new(command, payload))]);
        }

        #[test]
        fn prop_corruption_recovers(
            payload in prop::collection::vec(any::<u8>(), 0..32),
            flip in 1u8..=255,
        ) {
            let mut stream = encode(CMD_FRAME, &payload).unwrap();
            let last = stream.len() - 1;
            stream[last] ^= flip;
            stream.extend(encode(CMD_VERSION, b"ok").unwrap());

            let results = decode_all(&stream);
            prop_assert_eq!(results.len(), 2);
            prop_assert!(results[0].is_err());
            prop_assert_eq!(&results[1], &Ok(Packet::new(CMD_VERSION, b"ok".to_vec())));
        }
    }
}
