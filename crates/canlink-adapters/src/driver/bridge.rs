//! CANBridge adapter (binary framed protocol)
//!
//! Bus frames flow freely in both directions. Control commands (version,
//! bitrate, filter, open, close) go through a [`ControlSlot`]: one request in
//! flight, answered by a packet carrying the same command byte.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_codec::binary::{
    self, FramedDecoder, Packet, CMD_CLOSE, CMD_ERROR, CMD_FRAME, CMD_OPEN, CMD_VERSION,
};
use canlink_codec::AcceptanceFilter;
use canlink_core::{
    check_firmware, Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, Frame,
    RegistryBuilder, RegistryError,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info};

use crate::stream::{Decoded, Protocol, Session, StreamAdapter, StreamDecoder, StreamEncoder, Writer};
use crate::transport::{Transport, TransportOpener};

pub const CANBRIDGE: &str = "CANBridge";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

struct Pending {
    command: u8,
    reply: oneshot::Sender<AdapterResult<Packet>>,
}

/// Single-slot correlation of control requests and their replies
pub struct ControlSlot {
    permit: Semaphore,
    pending: Mutex<Option<Pending>>,
}

impl Default for ControlSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSlot {
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
            pending: Mutex::new(None),
        }
    }

    /// Write an encoded control packet and wait for its reply
    pub async fn request<W>(&self, io: &mut W, packet: &[u8]) -> AdapterResult<Packet>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let command = *packet
            .first()
            .ok_or_else(|| AdapterError::InvalidConfig("empty control packet".to_string()))?;
        let _permit = self.permit.acquire().await.map_err(|_| AdapterError::Closed)?;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(Pending { command, reply: tx });

        let result = async {
            io.write_all(packet).await?;
            io.flush().await?;
            match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(AdapterError::Closed),
                Err(_) => Err(AdapterError::Timeout(format!(
                    "no reply to command 0x{:02X}",
                    command
                ))),
            }
        }
        .await;
        self.pending.lock().take();
        result
    }

    /// Route a control reply to the waiting request.
    ///
    /// Hands the packet back when nothing is waiting for it.
    pub fn complete(&self, packet: Packet) -> Result<(), Packet> {
        let Some(pending) = self.pending.lock().take() else {
            return Err(packet);
        };
        let reply = if pending.command == packet.command {
            Ok(packet)
        } else {
            Err(AdapterError::ProtocolDecode(format!(
                "reply 0x{:02X} to command 0x{:02X}",
                packet.command, pending.command
            )))
        };
        let _ = pending.reply.send(reply);
        Ok(())
    }
}

/// Status byte of an acknowledgement: zero means accepted
fn acknowledged(reply: Packet) -> AdapterResult<()> {
    match reply.payload.first() {
        None | Some(0) => Ok(()),
        Some(status) => Err(AdapterError::ProtocolDecode(format!(
            "command 0x{:02X} refused with status {}",
            reply.command, status
        ))),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeProtocol;

#[async_trait]
impl Protocol for BridgeProtocol {
    async fn open(&self, io: &mut Box<dyn Transport>, base: &BaseAdapter) -> AdapterResult<Session> {
        let config = base.config();
        let slot = Arc::new(ControlSlot::new());
        let mut decoder = BridgeDecoder {
            inner: FramedDecoder::new(),
            slot: slot.clone(),
        };
        io.clear_input()?;

        {
            let (mut reader, mut writer) = tokio::io::split(&mut *io);
            let ready = tokio::select! {
                result = bring_up(&slot, &mut writer, base) => result,
                err = read_replies(&mut reader, &mut decoder, base) => Err(err),
            };
            ready.map_err(|e| match e {
                AdapterError::ProtocolDecode(msg) | AdapterError::Timeout(msg) => {
                    AdapterError::Handshake(msg)
                }
                other => other,
            })?;
        }
        info!(adapter = %base.name(), rate = config.can_rate, "Bus open");

        Ok(Session {
            decoder: Box::new(decoder),
            encoder: Box::new(BridgeEncoder {
                slot,
                extended: config.use_extended_id,
            }),
        })
    }
}

async fn bring_up<W>(slot: &ControlSlot, io: &mut W, base: &BaseAdapter) -> AdapterResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let config = base.config();

    let reply = slot.request(io, &binary::encode(CMD_VERSION, &[])?).await?;
    let version = String::from_utf8_lossy(&reply.payload).trim().to_string();
    debug!(adapter = %base.name(), version = %version, "Firmware");
    if config.print_version {
        base.info(&format!("{} firmware {}", base.name(), version));
    }
    check_firmware(&version, config.minimum_firmware_version.as_deref())?;

    acknowledged(slot.request(io, &binary::encode_bitrate(config.can_rate)?).await?)?;
    let filter = AcceptanceFilter::compute(&base.filter(), config.use_extended_id);
    acknowledged(slot.request(io, &binary::encode_filter(&filter)?).await?)?;
    acknowledged(slot.request(io, &binary::encode(CMD_OPEN, &[])?).await?)
}

/// Feed replies to the decoder until the transport fails
async fn read_replies<R>(reader: &mut R, decoder: &mut BridgeDecoder, base: &BaseAdapter) -> AdapterError
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 256];
    let mut events = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return AdapterError::TransportIo("transport closed during handshake".to_string()),
            Ok(n) => n,
            Err(e) => return e.into(),
        };
        decoder.decode(&buf[..n], &mut events);
        for event in events.drain(..) {
            match event {
                // The bus is not open yet
                Decoded::Frame(_) => {}
                Decoded::Info(text) => base.info(&text),
                Decoded::Fault(err) => base.report(err),
            }
        }
    }
}

struct BridgeDecoder {
    inner: FramedDecoder,
    slot: Arc<ControlSlot>,
}

impl StreamDecoder for BridgeDecoder {
    fn decode(&mut self, bytes: &[u8], out: &mut Vec<Decoded>) {
        let mut packets = Vec::new();
        self.inner.feed(bytes, &mut packets);
        for packet in packets {
            let event = match packet {
                Err(e) => Decoded::Fault(e.into()),
                Ok(packet) if packet.command == CMD_FRAME => match binary::decode_frame(&packet.payload) {
                    Ok(frame) => Decoded::Frame(frame),
                    Err(e) => Decoded::Fault(e.into()),
                },
                Ok(packet) if packet.command == CMD_ERROR => Decoded::Fault(AdapterError::ProtocolDecode(
                    format!("device error: {}", String::from_utf8_lossy(&packet.payload).trim()),
                )),
                Ok(packet) => match self.slot.complete(packet) {
                    Ok(()) => continue,
                    Err(packet) => Decoded::Fault(AdapterError::ProtocolDecode(format!(
                        "unsolicited reply 0x{:02X}",
                        packet.command
                    ))),
                },
            };
            out.push(event);
        }
    }
}

struct BridgeEncoder {
    slot: Arc<ControlSlot>,
    extended: bool,
}

#[async_trait]
impl StreamEncoder for BridgeEncoder {
    async fn send_frame(&mut self, io: &mut Writer, frame: &Frame) -> AdapterResult<()> {
        io.write_all(&binary::encode_frame(frame)?).await?;
        Ok(())
    }

    /// First byte is the command, the rest its payload
    async fn send_raw(&mut self, io: &mut Writer, raw: &[u8]) -> AdapterResult<()> {
        let Some((&command, payload)) = raw.split_first() else {
            return Ok(());
        };
        let packet = binary::encode(command, payload)?;
        if binary::is_control(command) {
            self.slot.request(io, &packet).await?;
        } else {
            io.write_all(&packet).await?;
        }
        Ok(())
    }

    async fn apply_filter(&mut self, io: &mut Writer, ids: &[u32]) -> AdapterResult<()> {
        let filter = AcceptanceFilter::compute(ids, self.extended);
        acknowledged(self.slot.request(io, &binary::encode_filter(&filter)?).await?)
    }

    // The receive pump is already gone, so the acknowledgement is not awaited
    async fn shutdown(&mut self, io: &mut Writer) -> AdapterResult<()> {
        io.write_all(&binary::encode(CMD_CLOSE, &[])?).await?;
        Ok(())
    }
}

pub(crate) fn register(
    builder: &mut RegistryBuilder,
    opener: Arc<dyn TransportOpener>,
) -> Result<(), RegistryError> {
    builder.register(
        AdapterInfo::new(CANBRIDGE, "Binary framed USB/serial CAN bridge").serial(),
        move |config| {
            Ok(Box::new(StreamAdapter::new(CANBRIDGE, config, BridgeProtocol, opener.clone()))
                as Box<dyn Adapter>)
        },
    )
}
