//! canlink-codec - wire-protocol codecs for CAN adapters
//!
//! Three protocol families cover every serial-attached adapter canlink drives.
//! Each is a pure, synchronous encode/decode strategy; the byte stream and the
//! pumps live in `canlink-adapters`.
//!
//! | Module     | Family                                   | Adapters           |
//! |------------|------------------------------------------|--------------------|
//! | [`ascii`]  | line-oriented ASCII with status register | CANUSB, SLCAN      |
//! | [`at`]     | AT commands with baud negotiation        | ELM327, OBDLink    |
//! | [`binary`] | length-prefixed, checksummed packets     | CANBridge          |
//!
//! Acceptance filters are computed once ([`filter::compute_filter`]) and then
//! packed per protocol, since each hardware family lays the bits out differently.

pub mod ascii;
pub mod at;
pub mod binary;
pub mod error;
pub mod filter;

pub use error::{CodecError, CodecResult};
pub use filter::{compute_filter, AcceptanceFilter};

/// Parse a run of ASCII hex digits into a u32
pub(crate) fn parse_hex_u32(digits: &[u8]) -> CodecResult<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return Err(CodecError::Malformed(format!(
            "bad hex field length {}",
            digits.len()
        )));
    }
    let text = std::str::from_utf8(digits)
        .map_err(|_| CodecError::Malformed("non-ASCII hex field".to_string()))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| CodecError::Malformed(format!("bad hex field '{}'", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32(b"7E8").unwrap(), 0x7E8);
        assert_eq!(parse_hex_u32(b"18daf110").unwrap(), 0x18DA_F110);
        assert!(parse_hex_u32(b"").is_err());
        assert!(parse_hex_u32(b"7G8").is_err());
        assert!(parse_hex_u32(b"123456789").is_err());
    }
}
