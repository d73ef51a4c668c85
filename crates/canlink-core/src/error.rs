//! Adapter error taxonomy

use thiserror::Error;

/// Result type for adapter operations
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by adapters, codecs and transports
///
/// `TransportIo`, `Handshake` and `Fatal` end the adapter. Everything else is
/// reported and the pumps keep running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Open/read/write failure on the physical link
    #[error("Transport I/O error: {0}")]
    TransportIo(String),

    /// Checksum mismatch, malformed line or unexpected byte
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Inbound channel was full, the frame was discarded
    #[error("Dropped frame 0x{id:X}: inbound channel full")]
    DroppedFrame { id: u32 },

    /// A bounded channel other than the inbound one was full
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Baud negotiation or firmware check failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The adapter is unusable (e.g. device unplugged)
    #[error("Fatal adapter error: {0}")]
    Fatal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Adapter not connected")]
    NotConnected,

    #[error("Adapter already connected")]
    AlreadyConnected,

    #[error("Adapter closed")]
    Closed,
}

impl AdapterError {
    /// Whether this error ends the adapter's pumps
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::TransportIo(_) | AdapterError::Handshake(_) | AdapterError::Fatal(_)
        )
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::TransportIo(err.to_string())
    }
}
