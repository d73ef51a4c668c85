//! Byte-stream transports under the codec drivers
//!
//! A [`Transport`] is an async byte pipe that can also change its line rate.
//! Drivers never open ports themselves; they ask a [`TransportOpener`] at
//! connect time, which is how tests swap a serial port for an in-memory pipe.

pub mod mock;
pub mod serial;

use std::time::Duration;

use canlink_core::{AdapterError, AdapterResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

pub use mock::{MockDevice, MockOpener, MockTransport};
pub use serial::{available_ports, SerialOpener, SerialTransport};

/// Async byte pipe with a configurable line rate
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Reconfigure the local side of the link
    fn set_baud_rate(&mut self, baud: u32) -> AdapterResult<()>;

    fn baud_rate(&self) -> u32;

    /// Discard anything received but not yet read
    fn clear_input(&mut self) -> AdapterResult<()>;
}

/// Opens the transport named by `Config::port`
pub trait TransportOpener: Send + Sync + 'static {
    fn open(&self, port: &str, baud: u32) -> AdapterResult<Box<dyn Transport>>;
}

/// Read and discard input until `window` has passed. Returns what was read.
pub async fn drain<T>(io: &mut T, window: Duration) -> AdapterResult<Vec<u8>>
where
    T: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Err(_) => return Ok(collected),
            Ok(Ok(0)) => {
                return Err(AdapterError::TransportIo(
                    "transport closed while draining".to_string(),
                ))
            }
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

/// Printable form of a command for logs and error text
pub(crate) fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
