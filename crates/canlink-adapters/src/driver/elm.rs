//! ELM327 and OBDLink adapters (AT-command protocol)
//!
//! Connecting runs the baud handshake first: the adapter may sit at any of
//! the candidate rates, so each is probed until the banner answers, then the
//! adapter is told to move to the configured rate. Initialization ends in
//! monitor mode (`ATMA`); sending a frame interrupts monitoring, sends, and
//! re-enters it once the outbound queue goes quiet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_codec::at::{self, AtDecoder, AtEncoder, AtEvent};
use canlink_codec::AcceptanceFilter;
use canlink_core::{
    check_firmware, Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, Capabilities,
    Frame, RegistryBuilder, RegistryError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::stream::{Decoded, Protocol, Session, StreamAdapter, StreamDecoder, StreamEncoder, Writer};
use crate::transport::{drain, printable, Transport, TransportOpener};

pub const ELM327: &str = "ELM327";
pub const OBDLINK_SX: &str = "OBDLink SX";

const INIT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);
const PROMPT_TIMEOUT: Duration = Duration::from_millis(300);

/// Baud handshake parameters
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Rates to probe, smallest risk first
    pub candidates: Vec<u32>,
    /// Accepted banner prefixes
    pub banners: Vec<&'static str>,
    /// How long to listen for a banner at each rate
    pub window: Duration,
    /// Full passes over the candidate list
    pub passes: usize,
    /// Drain period after the rate switch
    pub settle: Duration,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            candidates: at::BAUD_CANDIDATES.to_vec(),
            banners: vec![at::ELM_BANNER],
            window: Duration::from_millis(250),
            passes: 2,
            settle: Duration::from_millis(100),
        }
    }
}

/// Find the adapter's current rate, then switch it (and the port) to `target`.
///
/// Returns the banner line the adapter answered with.
pub async fn negotiate_baud(
    io: &mut Box<dyn Transport>,
    target: u32,
    handshake: &Handshake,
) -> AdapterResult<String> {
    for pass in 0..handshake.passes {
        for &rate in &handshake.candidates {
            io.set_baud_rate(rate)?;
            io.clear_input()?;
            io.write_all(at::PROBE).await?;
            io.write_all(at::PROBE).await?;

            let Some(banner) = listen_for_banner(io, handshake).await? else {
                debug!(rate, pass, "No banner");
                continue;
            };
            info!(rate, banner = %banner, "Adapter answered");

            if rate != target {
                io.write_all(&at::baud_switch_command(target)?).await?;
                io.set_baud_rate(target)?;
                drain(io, handshake.settle).await?;
                // Confirms the new rate; the prompt that follows is discarded
                io.write_all(b"\r").await?;
                drain(io, handshake.settle).await?;
                debug!(from = rate, to = target, "Rate switched");
            }
            return Ok(banner);
        }
    }
    Err(AdapterError::Handshake(format!(
        "no {} banner at any of {:?} baud",
        handshake.banners.join("/"),
        handshake.candidates
    )))
}

async fn listen_for_banner(
    io: &mut Box<dyn Transport>,
    handshake: &Handshake,
) -> AdapterResult<Option<String>> {
    let deadline = Instant::now() + handshake.window;
    let mut heard = Vec::new();
    let mut buf = [0u8; 128];
    loop {
        match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(Ok(0)) => {
                return Err(AdapterError::TransportIo(
                    "transport closed during handshake".to_string(),
                ))
            }
            Ok(Ok(n)) => heard.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
        let text = String::from_utf8_lossy(&heard);
        if at::banner_matches(&text, &handshake.banners) {
            let line = text
                .split(['\r', '\n', '>'])
                .map(str::trim)
                .find(|line| handshake.banners.iter().any(|b| line.starts_with(b)))
                .unwrap_or_default()
                .to_string();
            return Ok(Some(line));
        }
    }
}

/// AT-command protocol with a configurable banner set
#[derive(Debug, Clone)]
pub struct ElmProtocol {
    handshake: Handshake,
}

impl ElmProtocol {
    pub fn new(handshake: Handshake) -> Self {
        Self { handshake }
    }

    pub fn elm327() -> Self {
        Self::new(Handshake::default())
    }

    pub fn obdlink() -> Self {
        Self::new(Handshake {
            banners: vec![at::ELM_BANNER, at::STN_BANNER],
            ..Handshake::default()
        })
    }
}

#[async_trait]
impl Protocol for ElmProtocol {
    async fn open(&self, io: &mut Box<dyn Transport>, base: &BaseAdapter) -> AdapterResult<Session> {
        let config = base.config();
        let banner = negotiate_baud(io, config.port_baudrate, &self.handshake).await?;

        if config.print_version {
            base.info(&banner);
        }
        match (at::banner_version(&banner), config.minimum_firmware_version.as_deref()) {
            (Some(version), minimum) => check_firmware(&version, minimum)?,
            (None, Some(minimum)) => {
                return Err(AdapterError::Handshake(format!(
                    "firmware version unknown, {} required",
                    minimum
                )))
            }
            (None, None) => {}
        }

        let filter = AcceptanceFilter::compute(&base.filter(), config.use_extended_id);
        let mut decoder = AtDecoder::new(config.use_extended_id);
        for command in at::init_commands(config.can_rate, &filter)? {
            if command == at::MONITOR {
                io.write_all(&command).await?;
                break;
            }
            init_command(io, &mut decoder, &command, base).await?;
        }
        info!(adapter = %base.name(), rate = config.can_rate, "Monitoring");

        let (prompts_tx, prompts_rx) = watch::channel(0u64);
        Ok(Session {
            decoder: Box::new(ElmDecoder {
                inner: decoder,
                prompts: prompts_tx,
            }),
            encoder: Box::new(ElmEncoder {
                inner: AtEncoder::new(),
                prompts: prompts_rx,
                extended: config.use_extended_id,
                monitoring: true,
            }),
        })
    }
}

/// Send one init command and wait for `OK`. Clones reject some commands;
/// a rejection is reported and initialization carries on.
async fn init_command(
    io: &mut Box<dyn Transport>,
    decoder: &mut AtDecoder,
    command: &[u8],
    base: &BaseAdapter,
) -> AdapterResult<()> {
    io.write_all(command).await?;
    let deadline = Instant::now() + INIT_REPLY_TIMEOUT;
    let mut buf = [0u8; 128];
    let mut events = Vec::new();
    loop {
        let n = match tokio::time::timeout_at(deadline, io.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(AdapterError::Handshake(format!(
                    "no reply to '{}'",
                    printable(command)
                )))
            }
        };
        if n == 0 {
            return Err(AdapterError::TransportIo(
                "transport closed during initialization".to_string(),
            ));
        }
        decoder.feed(&buf[..n], &mut events);
        for event in events.drain(..) {
            match event {
                AtEvent::Ok => return Ok(()),
                AtEvent::Rejected => {
                    warn!(adapter = %base.name(), command = %printable(command), "Command rejected");
                    base.report(AdapterError::ProtocolDecode(format!(
                        "'{}' rejected",
                        printable(command)
                    )));
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

struct ElmDecoder {
    inner: AtDecoder,
    prompts: watch::Sender<u64>,
}

impl StreamDecoder for ElmDecoder {
    fn decode(&mut self, bytes: &[u8], out: &mut Vec<Decoded>) {
        let mut events = Vec::new();
        self.inner.feed(bytes, &mut events);
        for event in events {
            match event {
                AtEvent::Frame(frame) => out.push(Decoded::Frame(frame)),
                AtEvent::Prompt => self.prompts.send_modify(|count| *count += 1),
                AtEvent::Ok | AtEvent::Stopped | AtEvent::NoData => {}
                AtEvent::Rejected => out.push(Decoded::Fault(AdapterError::ProtocolDecode(
                    "command rejected".to_string(),
                ))),
                AtEvent::Text(text) => out.push(Decoded::Info(text)),
                AtEvent::Fault(e) => out.push(Decoded::Fault(e.into())),
            }
        }
    }
}

struct ElmEncoder {
    inner: AtEncoder,
    prompts: watch::Receiver<u64>,
    extended: bool,
    monitoring: bool,
}

impl ElmEncoder {
    /// Write `command` and wait for the prompt that ends its reply
    async fn command(&mut self, io: &mut Writer, command: &[u8]) -> AdapterResult<()> {
        self.prompts.borrow_and_update();
        io.write_all(command).await?;
        match tokio::time::timeout(PROMPT_TIMEOUT, self.prompts.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AdapterError::TransportIo(
                "receive pump stopped".to_string(),
            )),
            Err(_) => Err(AdapterError::Timeout(format!(
                "no prompt after '{}'",
                printable(command)
            ))),
        }
    }

    /// Leave monitor mode; any input stops it
    async fn interrupt(&mut self, io: &mut Writer) -> AdapterResult<()> {
        if self.monitoring {
            self.monitoring = false;
            self.command(io, b"\r").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamEncoder for ElmEncoder {
    async fn send_frame(&mut self, io: &mut Writer, frame: &Frame) -> AdapterResult<()> {
        let commands = self.inner.encode(frame)?;
        self.interrupt(io).await?;
        for command in commands {
            self.command(io, &command).await?;
        }
        Ok(())
    }

    async fn send_raw(&mut self, io: &mut Writer, raw: &[u8]) -> AdapterResult<()> {
        self.interrupt(io).await?;
        let mut command = raw.to_vec();
        if command.last() != Some(&b'\r') {
            command.push(b'\r');
        }
        self.command(io, &command).await
    }

    async fn apply_filter(&mut self, io: &mut Writer, ids: &[u32]) -> AdapterResult<()> {
        self.interrupt(io).await?;
        let filter = AcceptanceFilter::compute(ids, self.extended);
        for command in at::filter_commands(&filter) {
            self.command(io, &command).await?;
        }
        Ok(())
    }

    async fn idle(&mut self, io: &mut Writer) -> AdapterResult<()> {
        if !self.monitoring {
            io.write_all(at::MONITOR).await?;
            self.monitoring = true;
        }
        Ok(())
    }

    async fn shutdown(&mut self, io: &mut Writer) -> AdapterResult<()> {
        if self.monitoring {
            io.write_all(b"\r").await?;
            self.monitoring = false;
        }
        Ok(())
    }
}

pub(crate) fn register(
    builder: &mut RegistryBuilder,
    opener: Arc<dyn TransportOpener>,
) -> Result<(), RegistryError> {
    let elm_opener = opener.clone();
    builder.register(
        AdapterInfo::new(ELM327, "ELM327-compatible OBD adapter (AT commands)").serial(),
        move |config| {
            Ok(Box::new(StreamAdapter::new(
                ELM327,
                config,
                ElmProtocol::elm327(),
                elm_opener.clone(),
            )) as Box<dyn Adapter>)
        },
    )?;
    builder.register(
        AdapterInfo::new(OBDLINK_SX, "OBDLink SX (STN, AT commands)")
            .with_capabilities(Capabilities {
                hscan: true,
                kline: true,
                swcan: false,
            })
            .serial(),
        move |config| {
            Ok(Box::new(StreamAdapter::new(
                OBDLINK_SX,
                config,
                ElmProtocol::obdlink(),
                opener.clone(),
            )) as Box<dyn Adapter>)
        },
    )
}
