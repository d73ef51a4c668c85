//! AT-command protocol (ELM327 and compatibles)
//!
//! Configuration happens through `AT` commands; each reply ends with the `>`
//! prompt. In monitor mode (`ATMA`) every bus frame arrives as a line of hex
//! digits: identifier first, then the data bytes.
//!
//! The serial rate is negotiated before anything else, see
//! [`BAUD_CANDIDATES`] and [`baud_switch_command`].

use canlink_core::{Frame, MAX_EXTENDED_ID, MAX_STANDARD_ID};

use crate::error::{CodecError, CodecResult};
use crate::filter::AcceptanceFilter;
use crate::parse_hex_u32;

/// Serial rates probed during the handshake, in order
pub const BAUD_CANDIDATES: [u32; 6] = [38_400, 115_200, 230_400, 500_000, 1_000_000, 2_000_000];

/// Identification probe
pub const PROBE: &[u8] = b"ATI\r";
/// Banner prefix of ELM327 firmware
pub const ELM_BANNER: &str = "ELM327";
/// Banner prefix of STN-based (OBDLink) firmware
pub const STN_BANNER: &str = "STN";
/// Reference clock for `ATBRD`
pub const BRD_CLOCK: u32 = 4_000_000;
/// Prompt character that ends every reply
pub const PROMPT: u8 = b'>';
/// Start monitoring all traffic
pub const MONITOR: &[u8] = b"ATMA\r";
/// Classic CAN payload limit for this protocol
pub const MAX_PAYLOAD: usize = 8;

/// `ATBRD` divisor for `target` baud
pub fn baud_divisor(target: u32) -> CodecResult<u8> {
    if target == 0 {
        return Err(CodecError::UnsupportedRate(0.0));
    }
    let divisor = ((BRD_CLOCK as f64) / (target as f64)).round();
    if !(1.0..=255.0).contains(&divisor) {
        return Err(CodecError::UnsupportedRate(target as f64 / 1000.0));
    }
    Ok(divisor as u8)
}

/// Rate-switch directive for `target` baud
pub fn baud_switch_command(target: u32) -> CodecResult<Vec<u8>> {
    Ok(format!("ATBRD{:02X}\r", baud_divisor(target)?).into_bytes())
}

/// True when any line of `text` starts with one of `prefixes`
pub fn banner_matches(text: &str, prefixes: &[&str]) -> bool {
    text.split(['\r', '\n'])
        .map(|line| line.trim_start_matches('>').trim())
        .any(|line| prefixes.iter().any(|p| line.starts_with(p)))
}

/// Version number from a banner such as `ELM327 v1.5`
pub fn banner_version(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|word| {
            let word = word.trim_start_matches(['v', 'V']);
            word.starts_with(|c: char| c.is_ascii_digit()) && word.contains('.')
        })
        .map(|word| word.trim_start_matches(['v', 'V']).to_string())
}

/// `ATSP` protocol for the bus rate, plus `ATPB` for non-standard rates
pub fn protocol_commands(kbit: f64, extended: bool) -> CodecResult<Vec<Vec<u8>>> {
    let close = |rate: f64| (rate - kbit).abs() < 0.01;
    let protocol = match (close(500.0), close(250.0), extended) {
        (true, _, false) => "6",
        (true, _, true) => "7",
        (_, true, false) => "8",
        (_, true, true) => "9",
        _ => {
            // User-defined protocol B: options byte, then 500 kbit/s divided by the divisor
            let divisor = (500.0 / kbit).round();
            if kbit <= 0.0 || !(1.0..=64.0).contains(&divisor) || !close(500.0 / divisor) {
                return Err(CodecError::UnsupportedRate(kbit));
            }
            let options = if extended { 0x60 } else { 0xE0 };
            return Ok(vec![
                format!("ATPB{:02X}{:02X}\r", options, divisor as u8).into_bytes(),
                b"ATSPB\r".to_vec(),
            ]);
        }
    };
    Ok(vec![format!("ATSP{}\r", protocol).into_bytes()])
}

/// `ATCF`/`ATCM` pair. The adapter's mask marks bits that must match.
pub fn filter_commands(filter: &AcceptanceFilter) -> [Vec<u8>; 2] {
    let width = if filter.extended { 8 } else { 3 };
    let code = filter.code & filter.must_match_mask();
    [
        format!("ATCF{:0width$X}\r", code, width = width).into_bytes(),
        format!("ATCM{:0width$X}\r", filter.must_match_mask(), width = width).into_bytes(),
    ]
}

/// Commands issued after the rate handshake, ending with monitor mode
pub fn init_commands(kbit: f64, filter: &AcceptanceFilter) -> CodecResult<Vec<Vec<u8>>> {
    let mut commands: Vec<Vec<u8>> = [
        "ATE0\r", "ATL0\r", "ATS0\r", "ATH1\r", "ATAL\r", "ATCAF0\r",
    ]
    .iter()
    .map(|c| c.as_bytes().to_vec())
    .collect();
    commands.extend(protocol_commands(kbit, filter.extended)?);
    commands.extend(filter_commands(filter));
    commands.push(MONITOR.to_vec());
    Ok(commands)
}

/// Something the adapter said
#[derive(Debug, Clone, PartialEq)]
pub enum AtEvent {
    Frame(Frame),
    /// `>`: the adapter is ready for the next command
    Prompt,
    Ok,
    /// `?`: unknown or malformed command
    Rejected,
    /// Monitoring interrupted by input
    Stopped,
    NoData,
    /// Banner or other free text
    Text(String),
    Fault(CodecError),
}

/// Status lines the adapter uses to report trouble
const FAULT_LINES: [&str; 8] = [
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "BUFFER FULL",
    "DATA ERROR",
    "<DATA ERROR",
    "FB ERROR",
    "LV RESET",
];

/// Splits the reply stream into lines and `>` prompts
#[derive(Debug, Default)]
pub struct AtDecoder {
    line: Vec<u8>,
    extended: bool,
}

impl AtDecoder {
    pub fn new(extended: bool) -> Self {
        Self {
            line: Vec::new(),
            extended,
        }
    }

    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<AtEvent>) {
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => self.finish_line(out),
                PROMPT => {
                    self.finish_line(out);
                    out.push(AtEvent::Prompt);
                }
                0 => {}
                _ if self.line.len() >= 128 => {}
                _ => self.line.push(byte),
            }
        }
    }

    fn finish_line(&mut self, out: &mut Vec<AtEvent>) {
        if self.line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();
        if !text.is_empty() {
            out.push(decode_line(&text, self.extended));
        }
    }
}

/// Classify one reply line
pub fn decode_line(line: &str, extended: bool) -> AtEvent {
    match line {
        "OK" => return AtEvent::Ok,
        "?" => return AtEvent::Rejected,
        "STOPPED" => return AtEvent::Stopped,
        "NO DATA" => return AtEvent::NoData,
        _ => {}
    }
    if FAULT_LINES.iter().any(|f| line.starts_with(f)) || line.starts_with("ERR") {
        return AtEvent::Fault(CodecError::Status(line.to_string()));
    }

    let compact: Vec<u8> = line.bytes().filter(|b| *b != b' ').collect();
    if !compact.is_empty() && compact.iter().all(u8::is_ascii_hexdigit) {
        return match decode_frame(&compact, extended) {
            Ok(frame) => AtEvent::Frame(frame),
            Err(e) => AtEvent::Fault(e),
        };
    }
    AtEvent::Text(line.to_string())
}

fn decode_frame(hex_digits: &[u8], extended: bool) -> CodecResult<Frame> {
    let id_len = if extended { 8 } else { 3 };
    if hex_digits.len() < id_len {
        return Err(CodecError::Malformed(format!(
            "short frame line '{}'",
            String::from_utf8_lossy(hex_digits)
        )));
    }
    let id = parse_hex_u32(&hex_digits[..id_len])?;
    let limit = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
    if id > limit {
        return Err(CodecError::InvalidId(id));
    }
    let data = hex::decode(&hex_digits[id_len..])
        .map_err(|e| CodecError::Malformed(format!("frame data: {}", e)))?;
    if data.len() > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLong {
            len: data.len(),
            max: MAX_PAYLOAD,
        });
    }
    Ok(Frame::incoming(id, data).with_extended(extended))
}

/// Turns frames into header and data commands
///
/// The header is only re-sent when the identifier changes.
#[derive(Debug, Default)]
pub struct AtEncoder {
    header: Option<u32>,
}

impl AtEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the cached header (after a reset or reconnect)
    pub fn reset(&mut self) {
        self.header = None;
    }

    pub fn encode(&mut self, frame: &Frame) -> CodecResult<Vec<Vec<u8>>> {
        if frame.is_remote() {
            return Err(CodecError::Unsupported(
                "remote frames over AT commands".to_string(),
            ));
        }
        if frame.is_empty() || frame.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLong {
                len: frame.len(),
                max: MAX_PAYLOAD,
            });
        }
        let id = frame.id();
        if id > MAX_EXTENDED_ID {
            return Err(CodecError::InvalidId(id));
        }

        let mut commands = Vec::with_capacity(3);
        if self.header != Some(id) {
            if frame.is_extended() || id > MAX_STANDARD_ID {
                commands.push(format!("ATCP{:02X}\r", (id >> 24) & 0x1F).into_bytes());
                commands.push(format!("ATSH{:06X}\r", id & 0x00FF_FFFF).into_bytes());
            } else {
                commands.push(format!("ATSH{:03X}\r", id).into_bytes());
            }
            self.header = Some(id);
        }
        let mut data = hex::encode_upper(frame.data());
        data.push('\r');
        commands.push(data.into_bytes());
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::compute_filter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_baud_divisor() {
        assert_eq!(baud_divisor(500_000).unwrap(), 8);
        assert_eq!(baud_divisor(115_200).unwrap(), 35);
        assert_eq!(baud_divisor(2_000_000).unwrap(), 2);
        assert_eq!(baud_switch_command(500_000).unwrap(), b"ATBRD08\r".to_vec());
        assert!(baud_divisor(9_600).is_err());
        assert!(baud_divisor(0).is_err());
    }

    #[test]
    fn test_banner_matching() {
        assert!(banner_matches("ATI\r\rELM327 v1.5\r\r>", &[ELM_BANNER]));
        assert!(banner_matches(">STN1170 v4.2.1", &[ELM_BANNER, STN_BANNER]));
        assert!(!banner_matches("\u{0}\u{7f}garbage", &[ELM_BANNER]));
        assert_eq!(banner_version("ELM327 v1.5"), Some("1.5".to_string()));
        assert_eq!(banner_version("ELM327"), None);
    }

    #[test]
    fn test_protocol_selection() {
        assert_eq!(protocol_commands(500.0, false).unwrap(), vec![b"ATSP6\r".to_vec()]);
        assert_eq!(protocol_commands(250.0, true).unwrap(), vec![b"ATSP9\r".to_vec()]);
        assert_eq!(
            protocol_commands(125.0, false).unwrap(),
            vec![b"ATPBE004\r".to_vec(), b"ATSPB\r".to_vec()]
        );
        assert!(protocol_commands(333.0, false).is_err());
    }

    #[test]
    fn test_filter_uses_must_match_mask() {
        let [cf, cm] = filter_commands(&compute_filter(&[]));
        assert_eq!(cf, b"ATCF000\r".to_vec());
        assert_eq!(cm, b"ATCM000\r".to_vec());

        let [cf, cm] = filter_commands(&compute_filter(&[0x7E8, 0x7E9]));
        assert_eq!(cf, b"ATCF7E8\r".to_vec());
        assert_eq!(cm, b"ATCM7FE\r".to_vec());
    }

    #[test]
    fn test_init_ends_in_monitor_mode() {
        let commands = init_commands(500.0, &compute_filter(&[])).unwrap();
        assert_eq!(commands.first().unwrap(), &b"ATE0\r".to_vec());
        assert_eq!(commands.last().unwrap(), &MONITOR.to_vec());
    }

    #[test]
    fn test_decoder_lines_and_prompt() {
        let mut decoder = AtDecoder::new(false);
        let mut out = Vec::new();
        decoder.feed(b"OK\r\r>7E8 03 41 0C\r7E80", &mut out);
        decoder.feed(b"24100\rCAN ERROR\r?\r>", &mut out);
        assert_eq!(
            out,
            vec![
                AtEvent::Ok,
                AtEvent::Prompt,
                AtEvent::Frame(Frame::incoming(0x7E8, vec![0x03, 0x41, 0x0C])),
                AtEvent::Frame(Frame::incoming(0x7E8, vec![0x02, 0x41, 0x00])),
                AtEvent::Fault(CodecError::Status("CAN ERROR".to_string())),
                AtEvent::Rejected,
                AtEvent::Prompt,
            ]
        );
    }

    #[test]
    fn test_extended_frames() {
        match decode_line("18DAF110 02 50 01", true) {
            AtEvent::Frame(frame) => {
                assert_eq!(frame.id(), 0x18DA_F110);
                assert!(frame.is_extended());
                assert_eq!(frame.data(), &[0x02, 0x50, 0x01]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_odd_data_is_fault() {
        assert!(matches!(
            decode_line("7E8 0", false),
            AtEvent::Fault(CodecError::Malformed(_))
        ));
        assert_eq!(decode_line("ELM327 v1.5", false), AtEvent::Text("ELM327 v1.5".into()));
    }

    #[test]
    fn test_header_only_on_change() {
        let mut encoder = AtEncoder::new();
        let first = encoder.encode(&Frame::outgoing(0x7E0, vec![0x02, 0x10, 0x03])).unwrap();
        assert_eq!(first, vec![b"ATSH7E0\r".to_vec(), b"021003\r".to_vec()]);
        let second = encoder.encode(&Frame::outgoing(0x7E0, vec![0x01])).unwrap();
        assert_eq!(second, vec![b"01\r".to_vec()]);
        let third = encoder.encode(&Frame::outgoing(0x18DA_10F1, vec![0x01])).unwrap();
        assert_eq!(
            third,
            vec![b"ATCP18\r".to_vec(), b"ATSHDA10F1\r".to_vec(), b"01\r".to_vec()]
        );
    }
}
