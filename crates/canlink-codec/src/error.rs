//! Codec errors

use std::fmt;

use canlink_core::AdapterError;
use thiserror::Error;

/// Named fault from an ASCII adapter's status register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFault {
    ReceiveFifoFull,
    TransmitFifoFull,
    ErrorWarning,
    DataOverrun,
    ErrorPassive,
    ArbitrationLost,
    BusError,
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BusFault::ReceiveFifoFull => "receive FIFO full",
            BusFault::TransmitFifoFull => "transmit FIFO full",
            BusFault::ErrorWarning => "error warning",
            BusFault::DataOverrun => "data overrun",
            BusFault::ErrorPassive => "error passive",
            BusFault::ArbitrationLost => "arbitration lost",
            BusFault::BusError => "bus error",
        };
        f.write_str(text)
    }
}

/// Errors raised while encoding or decoding a wire protocol
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("unexpected byte 0x{0:02X}")]
    UnexpectedByte(u8),

    #[error("adapter rejected the last command")]
    Rejected,

    #[error("CAN status: {0}")]
    Bus(BusFault),

    /// Adapter-reported condition (e.g. `CAN ERROR`, `BUFFER FULL`)
    #[error("adapter status: {0}")]
    Status(String),

    #[error("payload too long: {len} bytes (max {max})")]
    PayloadTooLong { len: usize, max: usize },

    #[error("identifier 0x{0:X} out of range")]
    InvalidId(u32),

    #[error("unsupported bus rate: {0} kbit/s")]
    UnsupportedRate(f64),

    #[error("not supported: {0}")]
    Unsupported(String),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

impl From<CodecError> for AdapterError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::PayloadTooLong { .. }
            | CodecError::InvalidId(_)
            | CodecError::UnsupportedRate(_) => AdapterError::InvalidConfig(err.to_string()),
            CodecError::Unsupported(msg) => AdapterError::Unsupported(msg),
            other => AdapterError::ProtocolDecode(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_are_recoverable() {
        let err: AdapterError = CodecError::ChecksumMismatch {
            expected: 0x10,
            actual: 0x11,
        }
        .into();
        assert!(matches!(err, AdapterError::ProtocolDecode(_)));
        assert!(!err.is_fatal());

        let err: AdapterError = CodecError::Bus(BusFault::TransmitFifoFull).into();
        assert_eq!(
            err,
            AdapterError::ProtocolDecode("CAN status: transmit FIFO full".to_string())
        );
    }

    #[test]
    fn test_encode_limits_are_config_errors() {
        let err: AdapterError = CodecError::PayloadTooLong { len: 9, max: 8 }.into();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
    }
}
