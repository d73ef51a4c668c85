//! Line-oriented ASCII protocol (Lawicel CANUSB / SLCAN)
//!
//! Frames travel as `t`/`T`/`r`/`R` lines terminated by CR. The adapter
//! answers commands with a bare CR (or `z`/`Z` after a transmit) and rejects
//! them with BEL. Polling `F` returns a one-byte status register in two hex
//! digits.

use canlink_core::{Frame, FrameType, MAX_EXTENDED_ID, MAX_STANDARD_ID};

use crate::error::{BusFault, CodecError, CodecResult};
use crate::filter::AcceptanceFilter;
use crate::parse_hex_u32;

/// Line terminator
pub const CR: u8 = b'\r';
/// Command rejected
pub const BEL: u8 = 0x07;
/// Longest accepted line; longer input is discarded up to the next CR
pub const MAX_LINE: usize = 160;
/// Classic CAN payload limit for this protocol
pub const MAX_PAYLOAD: usize = 8;

/// Flush any half-typed command left in the adapter's line buffer
pub const RESYNC: &[u8] = b"\r\r\r";
/// Hardware version query
pub const VERSION: &[u8] = b"V\r";
/// Serial number query
pub const SERIAL: &[u8] = b"N\r";
/// Status register poll
pub const STATUS: &[u8] = b"F\r";
/// Open the channel
pub const OPEN: &[u8] = b"O\r";
/// Close the channel
pub const CLOSE: &[u8] = b"C\r";

/// Status register bits, lowest first
const STATUS_BITS: [(u8, Option<BusFault>); 8] = [
    (0x01, Some(BusFault::ReceiveFifoFull)),
    (0x02, Some(BusFault::TransmitFifoFull)),
    (0x04, Some(BusFault::ErrorWarning)),
    (0x08, Some(BusFault::DataOverrun)),
    (0x10, None),
    (0x20, Some(BusFault::ErrorPassive)),
    (0x40, Some(BusFault::ArbitrationLost)),
    (0x80, Some(BusFault::BusError)),
];

/// First fault set in the status register, scanning from bit 0 upwards
pub fn decode_status(register: u8) -> Option<BusFault> {
    STATUS_BITS
        .iter()
        .filter(|(bit, _)| register & bit != 0)
        .find_map(|(_, fault)| *fault)
}

/// Something the adapter said
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiEvent {
    Frame(Frame),
    /// `V`/`N` reply text
    Info(String),
    /// Empty line, `z` or `Z`
    Ack,
    /// Status register with no fault set
    StatusClear,
    Fault(CodecError),
}

/// Accumulates bytes into CR-terminated lines
#[derive(Debug, Default)]
pub struct AsciiDecoder {
    line: Vec<u8>,
    overflow: bool,
}

impl AsciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, appending one event per completed line
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<AsciiEvent>) {
        for &byte in bytes {
            match byte {
                CR => self.finish_line(out),
                b'\n' => {}
                BEL => {
                    self.line.clear();
                    self.overflow = false;
                    out.push(AsciiEvent::Fault(CodecError::Rejected));
                }
                _ if self.overflow => {}
                _ if self.line.len() >= MAX_LINE => {
                    self.line.clear();
                    self.overflow = true;
                }
                _ => self.line.push(byte),
            }
        }
    }

    fn finish_line(&mut self, out: &mut Vec<AsciiEvent>) {
        if self.overflow {
            self.overflow = false;
            out.push(AsciiEvent::Fault(CodecError::Malformed(format!(
                "line longer than {} bytes discarded",
                MAX_LINE
            ))));
            return;
        }
        let event = decode_line(&self.line);
        self.line.clear();
        out.push(event);
    }
}

/// Decode one line without its terminator
pub fn decode_line(line: &[u8]) -> AsciiEvent {
    let Some(&first) = line.first() else {
        return AsciiEvent::Ack;
    };
    let result = match first {
        b't' => decode_data(line, false, false),
        b'T' => decode_data(line, true, false),
        b'r' => decode_data(line, false, true),
        b'R' => decode_data(line, true, true),
        b'z' | b'Z' if line.len() == 1 => return AsciiEvent::Ack,
        b'F' => {
            return match decode_status_line(line) {
                Ok(None) => AsciiEvent::StatusClear,
                Ok(Some(fault)) => AsciiEvent::Fault(CodecError::Bus(fault)),
                Err(e) => AsciiEvent::Fault(e),
            }
        }
        b'V' | b'N' => return AsciiEvent::Info(String::from_utf8_lossy(line).into_owned()),
        other => Err(CodecError::UnexpectedByte(other)),
    };
    match result {
        Ok(frame) => AsciiEvent::Frame(frame),
        Err(e) => AsciiEvent::Fault(e),
    }
}

fn decode_status_line(line: &[u8]) -> CodecResult<Option<BusFault>> {
    if line.len() != 3 {
        return Err(CodecError::Malformed(format!(
            "status reply '{}'",
            String::from_utf8_lossy(line)
        )));
    }
    let register = parse_hex_u32(&line[1..3])? as u8;
    Ok(decode_status(register))
}

fn decode_data(line: &[u8], extended: bool, remote: bool) -> CodecResult<Frame> {
    let id_len = if extended { 8 } else { 3 };
    if line.len() < 2 + id_len {
        return Err(CodecError::Malformed(format!(
            "short frame line '{}'",
            String::from_utf8_lossy(line)
        )));
    }
    let id = parse_hex_u32(&line[1..1 + id_len])?;
    let limit = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
    if id > limit {
        return Err(CodecError::InvalidId(id));
    }
    let dlc = parse_hex_u32(&line[1 + id_len..2 + id_len])? as usize;
    if dlc > MAX_PAYLOAD {
        return Err(CodecError::Malformed(format!("data length {}", dlc)));
    }
    if remote {
        return Ok(Frame::remote(id, extended, FrameType::INCOMING));
    }

    // Data may be followed by a 4-digit timestamp when timestamps are enabled
    let hex_data = &line[2 + id_len..];
    if hex_data.len() != dlc * 2 && hex_data.len() != dlc * 2 + 4 {
        return Err(CodecError::Malformed(format!(
            "expected {} data bytes in '{}'",
            dlc,
            String::from_utf8_lossy(line)
        )));
    }
    let data = hex::decode(&hex_data[..dlc * 2])
        .map_err(|e| CodecError::Malformed(format!("frame data: {}", e)))?;
    Ok(Frame::incoming(id, data).with_extended(extended))
}

/// Encode a frame as a transmit command
pub fn encode_frame(frame: &Frame) -> CodecResult<Vec<u8>> {
    if frame.len() > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLong {
            len: frame.len(),
            max: MAX_PAYLOAD,
        });
    }
    let extended = frame.is_extended() || frame.id() > MAX_STANDARD_ID;
    if frame.id() > MAX_EXTENDED_ID {
        return Err(CodecError::InvalidId(frame.id()));
    }

    let mut line = match (extended, frame.is_remote()) {
        (false, false) => format!("t{:03X}{:X}", frame.id(), frame.len()),
        (true, false) => format!("T{:08X}{:X}", frame.id(), frame.len()),
        (false, true) => format!("r{:03X}0", frame.id()),
        (true, true) => format!("R{:08X}0", frame.id()),
    };
    if !frame.is_remote() {
        line.push_str(&hex::encode_upper(frame.data()));
    }
    line.push('\r');
    Ok(line.into_bytes())
}

/// Bit-rate command for `kbit`: `S0`..`S8` for standard rates, raw BTR otherwise
pub fn bitrate_command(kbit: f64) -> CodecResult<Vec<u8>> {
    const STANDARD: [(f64, u8); 9] = [
        (10.0, 0),
        (20.0, 1),
        (50.0, 2),
        (100.0, 3),
        (125.0, 4),
        (250.0, 5),
        (500.0, 6),
        (800.0, 7),
        (1000.0, 8),
    ];
    // BTR0/BTR1 for a 16 MHz SJA1000
    const CUSTOM: [(f64, &str); 3] = [(615.384, "4037"), (47.619, "CB9A"), (33.3, "0E1C")];

    let close = |rate: f64| (rate - kbit).abs() < 0.01;
    if let Some((_, index)) = STANDARD.iter().find(|(rate, _)| close(*rate)) {
        return Ok(format!("S{}\r", index).into_bytes());
    }
    if let Some((_, btr)) = CUSTOM.iter().find(|(rate, _)| close(*rate)) {
        return Ok(format!("s{}\r", btr).into_bytes());
    }
    Err(CodecError::UnsupportedRate(kbit))
}

/// `M` (code) and `m` (mask) commands for the SJA1000 dual-filter layout
///
/// Each 16-bit half holds the identifier shifted left by 5 with the RTR and
/// data bits left open; both halves carry the same window.
pub fn filter_commands(filter: &AcceptanceFilter) -> [Vec<u8>; 2] {
    let code = mirror((filter.code & MAX_STANDARD_ID) << 5);
    let mask = mirror(((filter.mask & MAX_STANDARD_ID) << 5) | 0x1F);
    [
        format!("M{:08X}\r", code).into_bytes(),
        format!("m{:08X}\r", mask).into_bytes(),
    ]
}

fn mirror(half: u32) -> u32 {
    (half << 16) | (half & 0xFFFF)
}

/// Commands that bring the channel up, in order
pub fn open_sequence(kbit: f64, filter: &AcceptanceFilter) -> CodecResult<Vec<Vec<u8>>> {
    let [code, mask] = filter_commands(filter);
    Ok(vec![
        RESYNC.to_vec(),
        VERSION.to_vec(),
        SERIAL.to_vec(),
        CLOSE.to_vec(),
        bitrate_command(kbit)?,
        code,
        mask,
        OPEN.to_vec(),
    ])
}
