//! CANUSB and SLCAN adapters (ASCII line protocol)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_codec::ascii::{self, AsciiDecoder, AsciiEvent};
use canlink_codec::{AcceptanceFilter, CodecError};
use canlink_core::{
    check_firmware, Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, Frame,
    RegistryBuilder, RegistryError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::stream::{Decoded, Protocol, Session, StreamAdapter, StreamDecoder, StreamEncoder, Writer};
use crate::transport::{drain, printable, Transport, TransportOpener};

pub const CANUSB: &str = "CANUSB";
pub const SLCAN: &str = "SLCAN";

const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
const RESYNC_SETTLE: Duration = Duration::from_millis(50);
const STATUS_PERIOD: Duration = Duration::from_secs(1);

/// Which flavour of the ASCII protocol the device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Lawicel CANUSB: SJA1000 hardware filter
    CanUsb,
    /// Generic SLCAN firmware: filter in software
    Slcan,
}

#[derive(Debug, Clone, Copy)]
pub struct LawicelProtocol {
    dialect: Dialect,
}

impl LawicelProtocol {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Hardware window for `ids`. Only the 11-bit layout is packed; extended
    /// traffic runs with the filter open.
    fn hardware_filter(&self, ids: &[u32], extended: bool) -> AcceptanceFilter {
        match self.dialect {
            Dialect::CanUsb if !extended => AcceptanceFilter::compute(ids, false),
            _ => AcceptanceFilter::accept_all(false),
        }
    }
}

#[async_trait]
impl Protocol for LawicelProtocol {
    async fn open(&self, io: &mut Box<dyn Transport>, base: &BaseAdapter) -> AdapterResult<Session> {
        let config = base.config();
        let filter = self.hardware_filter(&base.filter(), config.use_extended_id);
        let mut decoder = AsciiDecoder::new();
        io.clear_input()?;

        for command in ascii::open_sequence(config.can_rate, &filter)? {
            match command[0] {
                b'\r' => {
                    io.write_all(&command).await?;
                    drain(io, RESYNC_SETTLE).await?;
                    decoder = AsciiDecoder::new();
                }
                b'V' => {
                    let banner = optional(exchange(io, &mut decoder, &command).await)?;
                    check_version(base, banner.as_deref())?;
                }
                b'N' => {
                    if let Some(serial) = optional(exchange(io, &mut decoder, &command).await)? {
                        debug!(adapter = %base.name(), serial = %serial.trim_start_matches('N'), "Serial number");
                    }
                }
                // Closing an already closed channel is rejected; that is fine
                b'C' => {
                    optional(exchange(io, &mut decoder, &command).await)?;
                }
                _ => {
                    exchange(io, &mut decoder, &command).await.map_err(|e| match e {
                        AdapterError::ProtocolDecode(msg) | AdapterError::Timeout(msg) => {
                            AdapterError::Handshake(msg)
                        }
                        other => other,
                    })?;
                }
            }
        }
        info!(adapter = %base.name(), rate = config.can_rate, "Channel open");

        Ok(Session {
            decoder: Box::new(LawicelDecoder { inner: decoder }),
            encoder: Box::new(LawicelEncoder {
                protocol: *self,
                extended: config.use_extended_id,
            }),
        })
    }

    fn software_filter(&self) -> bool {
        self.dialect == Dialect::Slcan
    }
}

/// Send `command` and wait for its reply line
async fn exchange(
    io: &mut Box<dyn Transport>,
    decoder: &mut AsciiDecoder,
    command: &[u8],
) -> AdapterResult<Option<String>> {
    io.write_all(command).await?;
    let deadline = Instant::now() + REPLY_TIMEOUT;
    let mut buf = [0u8; 256];
    let mut events = Vec::new();
    loop {
        let n = match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(AdapterError::Timeout(format!(
                    "no reply to '{}'",
                    printable(command)
                )))
            }
        };
        if n == 0 {
            return Err(AdapterError::TransportIo(
                "transport closed during handshake".to_string(),
            ));
        }
        decoder.feed(&buf[..n], &mut events);
        for event in events.drain(..) {
            match event {
                AsciiEvent::Ack | AsciiEvent::StatusClear => return Ok(None),
                AsciiEvent::Info(text) => return Ok(Some(text)),
                AsciiEvent::Fault(CodecError::Rejected) => {
                    return Err(AdapterError::ProtocolDecode(format!(
                        "'{}' rejected",
                        printable(command)
                    )))
                }
                AsciiEvent::Frame(_) | AsciiEvent::Fault(_) => {}
            }
        }
    }
}

/// Treat a rejected or unanswered query as "no answer"
fn optional(reply: AdapterResult<Option<String>>) -> AdapterResult<Option<String>> {
    match reply {
        Err(AdapterError::ProtocolDecode(_)) | Err(AdapterError::Timeout(_)) => Ok(None),
        other => other,
    }
}

/// `Vhhss`: two hardware digits, two software digits
fn software_version(banner: &str) -> Option<String> {
    let digits = banner.strip_prefix('V')?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let sw = &digits[2..4];
    Some(format!("{}.{}", &sw[..1], &sw[1..]))
}

fn check_version(base: &BaseAdapter, banner: Option<&str>) -> AdapterResult<()> {
    let config = base.config();
    let version = banner.and_then(software_version);
    if let Some(banner) = banner {
        if config.print_version {
            base.info(&format!("{} firmware {}", base.name(), banner));
        }
    }
    match (&version, config.minimum_firmware_version.as_deref()) {
        (Some(version), minimum) => check_firmware(version, minimum),
        (None, Some(minimum)) => Err(AdapterError::Handshake(format!(
            "firmware version unknown, {} required",
            minimum
        ))),
        (None, None) => Ok(()),
    }
}

struct LawicelDecoder {
    inner: AsciiDecoder,
}

impl StreamDecoder for LawicelDecoder {
    fn decode(&mut self, bytes: &[u8], out: &mut Vec<Decoded>) {
        let mut events = Vec::new();
        self.inner.feed(bytes, &mut events);
        out.extend(events.into_iter().filter_map(|event| match event {
            AsciiEvent::Frame(frame) => Some(Decoded::Frame(frame)),
            AsciiEvent::Info(text) => Some(Decoded::Info(text)),
            AsciiEvent::Ack | AsciiEvent::StatusClear => None,
            AsciiEvent::Fault(e) => Some(Decoded::Fault(e.into())),
        }));
    }
}

struct LawicelEncoder {
    protocol: LawicelProtocol,
    extended: bool,
}

#[async_trait]
impl StreamEncoder for LawicelEncoder {
    async fn send_frame(&mut self, io: &mut Writer, frame: &Frame) -> AdapterResult<()> {
        io.write_all(&ascii::encode_frame(frame)?).await?;
        Ok(())
    }

    async fn apply_filter(&mut self, io: &mut Writer, ids: &[u32]) -> AdapterResult<()> {
        if self.protocol.dialect == Dialect::Slcan {
            return Ok(());
        }
        // The acceptance registers are only writable while the channel is closed
        let [code, mask] = ascii::filter_commands(&self.protocol.hardware_filter(ids, self.extended));
        for command in [ascii::CLOSE, code.as_slice(), mask.as_slice(), ascii::OPEN] {
            io.write_all(command).await?;
        }
        Ok(())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(STATUS_PERIOD)
    }

    async fn poll(&mut self, io: &mut Writer) -> AdapterResult<()> {
        io.write_all(ascii::STATUS).await?;
        Ok(())
    }

    async fn shutdown(&mut self, io: &mut Writer) -> AdapterResult<()> {
        io.write_all(ascii::CLOSE).await?;
        Ok(())
    }
}

pub(crate) fn register(
    builder: &mut RegistryBuilder,
    opener: Arc<dyn TransportOpener>,
) -> Result<(), RegistryError> {
    let canusb_opener = opener.clone();
    builder.register(
        AdapterInfo::new(CANUSB, "Lawicel CANUSB (ASCII, SJA1000 hardware filter)").serial(),
        move |config| {
            Ok(Box::new(StreamAdapter::new(
                CANUSB,
                config,
                LawicelProtocol::new(Dialect::CanUsb),
                canusb_opener.clone(),
            )) as Box<dyn Adapter>)
        },
    )?;
    builder.register(
        AdapterInfo::new(SLCAN, "SLCAN-compatible serial adapter (ASCII)").serial(),
        move |config| {
            Ok(Box::new(StreamAdapter::new(
                SLCAN,
                config,
                LawicelProtocol::new(Dialect::Slcan),
                opener.clone(),
            )) as Box<dyn Adapter>)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_version() {
        assert_eq!(software_version("V1013"), Some("1.3".to_string()));
        assert_eq!(software_version("V10"), None);
        assert_eq!(software_version("N1234"), None);
    }

    #[test]
    fn test_hardware_filter_by_dialect() {
        let canusb = LawicelProtocol::new(Dialect::CanUsb);
        assert_eq!(canusb.hardware_filter(&[0x7E8], false).code, 0x7E8);
        assert!(canusb.hardware_filter(&[0x7E8], true).is_accept_all());
        let slcan = LawicelProtocol::new(Dialect::Slcan);
        assert!(slcan.hardware_filter(&[0x7E8], false).is_accept_all());
        assert!(slcan.software_filter());
    }

    #[test]
    fn test_decoder_maps_events() {
        let mut decoder = LawicelDecoder {
            inner: AsciiDecoder::new(),
        };
        let mut out = Vec::new();
        decoder.decode(b"z\rt7E8101\rF02\r", &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Decoded::Frame(f) if f.id() == 0x7E8));
        assert!(matches!(&out[1], Decoded::Fault(AdapterError::ProtocolDecode(_))));
    }
}
