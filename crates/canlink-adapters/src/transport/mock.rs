//! In-memory transport for tests
//!
//! [`mock::pair`](pair) returns the host end (a [`Transport`]) and the device
//! end of a duplex pipe. The device can pin itself to a line rate; while the
//! host is configured for a different rate, host writes are lost and host reads
//! come back as noise, much like a real UART at the wrong speed.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use canlink_core::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use super::{Transport, TransportOpener};

const PIPE_CAPACITY: usize = 4096;
/// Device rate meaning "answers at any rate"
const ANY_RATE: u32 = 0;

#[derive(Debug, Default)]
struct LineRates {
    host: AtomicU32,
    device: AtomicU32,
}

impl LineRates {
    fn matched(&self) -> bool {
        let device = self.device.load(Ordering::SeqCst);
        device == ANY_RATE || device == self.host.load(Ordering::SeqCst)
    }
}

/// Host end of the pipe
pub struct MockTransport {
    io: DuplexStream,
    rates: Arc<LineRates>,
}

/// Device end of the pipe
pub struct MockDevice {
    io: DuplexStream,
    rates: Arc<LineRates>,
}

/// Connected host/device pair; the device answers at any rate until pinned
pub fn pair(host_baud: u32) -> (MockTransport, MockDevice) {
    let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
    let rates = Arc::new(LineRates::default());
    rates.host.store(host_baud, Ordering::SeqCst);
    (
        MockTransport {
            io: host,
            rates: rates.clone(),
        },
        MockDevice { io: device, rates },
    )
}

impl MockDevice {
    /// Only talk at `baud` from now on
    pub fn pin_rate(&self, baud: u32) {
        self.rates.device.store(baud, Ordering::SeqCst);
    }

    /// Rate the host side is currently configured for
    pub fn host_baud(&self) -> u32 {
        self.rates.host.load(Ordering::SeqCst)
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        if poll.is_ready() && !this.rates.matched() {
            for byte in &mut buf.filled_mut()[before..] {
                *byte = 0xFF;
            }
        }
        poll
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.rates.matched() {
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Transport for MockTransport {
    fn set_baud_rate(&mut self, baud: u32) -> AdapterResult<()> {
        self.rates.host.store(baud, Ordering::SeqCst);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.rates.host.load(Ordering::SeqCst)
    }

    // Bytes already in the pipe cannot be recalled
    fn clear_input(&mut self) -> AdapterResult<()> {
        Ok(())
    }
}

impl AsyncRead for MockDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Hands out one prepared [`MockTransport`]
pub struct MockOpener {
    transport: Mutex<Option<MockTransport>>,
}

impl MockOpener {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

impl TransportOpener for MockOpener {
    fn open(&self, _port: &str, baud: u32) -> AdapterResult<Box<dyn Transport>> {
        let mut transport = self
            .transport
            .lock()
            .take()
            .ok_or_else(|| AdapterError::TransportIo("mock transport already opened".to_string()))?;
        transport.set_baud_rate(baud)?;
        Ok(Box::new(transport))
    }
}
