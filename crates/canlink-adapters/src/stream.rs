//! Codec-driven adapter over a byte-stream transport
//!
//! Every serial driver is a [`StreamAdapter`] parameterised by a [`Protocol`].
//! The protocol performs the handshake on the raw transport and returns a
//! decoder (owned by the receive pump) and an encoder (owned by the send pump).
//! Everything else, channels, shutdown, filter updates and housekeeping ticks,
//! lives here once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_core::{
    Adapter, AdapterError, AdapterResult, BaseAdapter, CancelToken, Config, Frame,
    DEFAULT_CLOSE_GRACE, SYSTEM_MSG, SYSTEM_MSG_COMMAND, SYSTEM_MSG_FILTER,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportOpener};

/// Write side of a split transport
pub type Writer = WriteHalf<Box<dyn Transport>>;

type Reader = ReadHalf<Box<dyn Transport>>;

const READ_CHUNK: usize = 512;
/// Quiet time after the last write before the encoder's idle hook runs
const IDLE_DELAY: Duration = Duration::from_millis(20);
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const FILTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Output of a protocol decoder
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    Info(String),
    Fault(AdapterError),
}

/// Incoming half of a protocol, owned by the receive pump
pub trait StreamDecoder: Send + 'static {
    fn decode(&mut self, bytes: &[u8], out: &mut Vec<Decoded>);
}

/// Outgoing half of a protocol, owned by the send pump
#[async_trait]
pub trait StreamEncoder: Send + 'static {
    async fn send_frame(&mut self, io: &mut Writer, frame: &Frame) -> AdapterResult<()>;

    /// Raw command from a `SYSTEM_MSG_COMMAND` frame
    async fn send_raw(&mut self, io: &mut Writer, raw: &[u8]) -> AdapterResult<()> {
        io.write_all(raw).await?;
        Ok(())
    }

    /// Push a new acceptance filter to the device
    async fn apply_filter(&mut self, io: &mut Writer, ids: &[u32]) -> AdapterResult<()>;

    /// Period of the housekeeping tick, if the protocol needs one
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    async fn poll(&mut self, _io: &mut Writer) -> AdapterResult<()> {
        Ok(())
    }

    /// Runs once the outbound queue has been quiet for a moment
    async fn idle(&mut self, _io: &mut Writer) -> AdapterResult<()> {
        Ok(())
    }

    /// Close sequence, written when the adapter shuts down
    async fn shutdown(&mut self, io: &mut Writer) -> AdapterResult<()>;
}

/// Codec halves produced by a successful handshake
pub struct Session {
    pub decoder: Box<dyn StreamDecoder>,
    pub encoder: Box<dyn StreamEncoder>,
}

/// Handshake plus codec for one adapter family
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Bring the device up on a freshly opened transport
    async fn open(&self, io: &mut Box<dyn Transport>, base: &BaseAdapter) -> AdapterResult<Session>;

    /// Filter inbound frames against the exact id list in software
    fn software_filter(&self) -> bool {
        false
    }
}

enum Control {
    Filter(Vec<u32>, oneshot::Sender<AdapterResult<()>>),
}

/// Adapter built from a transport opener and a protocol
pub struct StreamAdapter<P: Protocol> {
    base: Arc<BaseAdapter>,
    protocol: Arc<P>,
    opener: Arc<dyn TransportOpener>,
    control_tx: mpsc::Sender<Control>,
    control_rx: Mutex<Option<mpsc::Receiver<Control>>>,
}

impl<P: Protocol> StreamAdapter<P> {
    pub fn new(
        name: impl Into<String>,
        config: Config,
        protocol: P,
        opener: Arc<dyn TransportOpener>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(4);
        Self {
            base: Arc::new(BaseAdapter::new(name, config)),
            protocol: Arc::new(protocol),
            opener,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    pub fn base(&self) -> &BaseAdapter {
        &self.base
    }
}

#[async_trait]
impl<P: Protocol> Adapter for StreamAdapter<P> {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()> {
        self.base.mark_connected()?;
        let config = self.base.config();
        info!(adapter = %self.base.name(), port = %config.port, "Connecting");

        let mut io = self.opener.open(&config.port, config.port_baudrate)?;
        let session = tokio::select! {
            result = self.protocol.open(&mut io, &self.base) => result?,
            _ = ctx.cancelled() => {
                return Err(AdapterError::Handshake("connect cancelled".to_string()))
            }
            _ = self.base.shutdown().cancelled() => return Err(AdapterError::Closed),
        };

        let outbound = self
            .base
            .take_outbound()
            .ok_or(AdapterError::AlreadyConnected)?;
        let control = self
            .control_rx
            .lock()
            .take()
            .ok_or(AdapterError::AlreadyConnected)?;

        // Either pump halts both on a fatal fault; cancelling ctx halts them too
        let halt = ctx.child();
        let (reader, writer) = tokio::io::split(io);
        self.base.spawn(recv_pump(
            self.base.clone(),
            reader,
            session.decoder,
            self.protocol.software_filter(),
            halt.clone(),
        ));
        self.base.spawn(send_pump(
            self.base.clone(),
            writer,
            session.encoder,
            outbound,
            control,
            halt,
        ));

        info!(adapter = %self.base.name(), "Connected");
        Ok(())
    }

    fn sender(&self) -> mpsc::Sender<Frame> {
        self.base.sender()
    }

    fn recv(&self) -> Option<mpsc::Receiver<Frame>> {
        self.base.take_recv()
    }

    fn errors(&self) -> Option<mpsc::Receiver<AdapterError>> {
        self.base.take_errors()
    }

    async fn close(&self) -> AdapterResult<()> {
        if self.base.close(DEFAULT_CLOSE_GRACE).await {
            info!(adapter = %self.base.name(), "Closed");
        }
        Ok(())
    }

    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()> {
        if self.base.is_closed() {
            return Err(AdapterError::Closed);
        }
        if !self.base.is_connected() {
            // Picked up by the handshake
            self.base.set_filter_ids(ids);
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Filter(ids.to_vec(), tx))
            .await
            .map_err(|_| AdapterError::Closed)?;
        match tokio::time::timeout(FILTER_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::Closed),
            Err(_) => Err(AdapterError::Timeout("filter update".to_string())),
        }
    }
}

impl<P: Protocol> Drop for StreamAdapter<P> {
    fn drop(&mut self) {
        self.base.shutdown().cancel();
    }
}

async fn recv_pump(
    base: Arc<BaseAdapter>,
    mut reader: Reader,
    mut decoder: Box<dyn StreamDecoder>,
    software_filter: bool,
    halt: CancelToken,
) {
    let shutdown = base.shutdown().clone();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut events = Vec::new();

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = halt.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                base.report(AdapterError::TransportIo("transport closed".to_string()));
                halt.cancel();
                break;
            }
            Ok(n) => n,
            Err(e) => {
                base.report(e.into());
                halt.cancel();
                break;
            }
        };
        if base.config().debug {
            debug!(adapter = %base.name(), rx = %hex::encode(&buf[..n]), "Read");
        }

        decoder.decode(&buf[..n], &mut events);
        for event in events.drain(..) {
            match event {
                Decoded::Frame(frame) => {
                    if software_filter && !base.accepts(frame.id()) {
                        continue;
                    }
                    base.deliver(frame);
                }
                Decoded::Info(text) => base.info(&text),
                Decoded::Fault(err) => base.report(err),
            }
        }
    }
    debug!(adapter = %base.name(), "Receive pump stopped");
}

async fn send_pump(
    base: Arc<BaseAdapter>,
    mut writer: Writer,
    mut encoder: Box<dyn StreamEncoder>,
    mut outbound: mpsc::Receiver<Frame>,
    mut control: mpsc::Receiver<Control>,
    halt: CancelToken,
) {
    let shutdown = base.shutdown().clone();
    let mut ticker = encoder.poll_interval().map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut idle_pending = false;

    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = halt.cancelled() => break,
            Some(Control::Filter(ids, reply)) = control.recv() => {
                idle_pending = true;
                let write = apply_filter(&base, encoder.as_mut(), &mut writer, &ids);
                let Some(result) = unless_stopped(&shutdown, &halt, write).await else {
                    let _ = reply.send(Err(AdapterError::Closed));
                    break;
                };
                let fatal = matches!(&result, Err(e) if e.is_fatal());
                let _ = reply.send(result);
                if fatal {
                    halt.cancel();
                    break;
                }
                Some(Ok(()))
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    idle_pending = true;
                    let write = write_frame(&base, encoder.as_mut(), &mut writer, frame);
                    unless_stopped(&shutdown, &halt, write).await
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => {
                unless_stopped(&shutdown, &halt, encoder.poll(&mut writer)).await
            }
            _ = tokio::time::sleep(IDLE_DELAY), if idle_pending => {
                idle_pending = false;
                unless_stopped(&shutdown, &halt, encoder.idle(&mut writer)).await
            }
        };

        let Some(step) = step else {
            break;
        };
        if let Err(err) = step {
            let fatal = err.is_fatal();
            base.report(err);
            if fatal {
                halt.cancel();
                break;
            }
        }
    }

    if shutdown.is_cancelled() {
        let close = async {
            encoder.shutdown(&mut writer).await?;
            writer.flush().await?;
            Ok::<_, AdapterError>(())
        };
        match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(adapter = %base.name(), error = %e, "Close sequence failed"),
            Err(_) => warn!(adapter = %base.name(), "Close sequence timed out"),
        }
    }
    debug!(adapter = %base.name(), "Send pump stopped");
}

/// A stalled device write must not outlive the adapter; `None` when
/// shutdown or halt came first
async fn unless_stopped<F>(
    shutdown: &CancelToken,
    halt: &CancelToken,
    write: F,
) -> Option<AdapterResult<()>>
where
    F: std::future::Future<Output = AdapterResult<()>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        _ = halt.cancelled() => None,
        result = write => Some(result),
    }
}

async fn write_frame(
    base: &BaseAdapter,
    encoder: &mut dyn StreamEncoder,
    writer: &mut Writer,
    frame: Frame,
) -> AdapterResult<()> {
    match frame.id() {
        SYSTEM_MSG_COMMAND => encoder.send_raw(writer, frame.data()).await,
        SYSTEM_MSG_FILTER => {
            let ids = frame.filter_ids().ok_or_else(|| {
                AdapterError::ProtocolDecode("filter update with a ragged payload".to_string())
            })?;
            apply_filter(base, encoder, writer, &ids).await
        }
        id if id >= SYSTEM_MSG => {
            debug!(adapter = %base.name(), id = format_args!("0x{:X}", id), "Ignoring system frame");
            Ok(())
        }
        _ => {
            if base.config().debug {
                debug!(adapter = %base.name(), frame = %frame, "Write");
            }
            encoder.send_frame(writer, &frame).await
        }
    }
}

async fn apply_filter(
    base: &BaseAdapter,
    encoder: &mut dyn StreamEncoder,
    writer: &mut Writer,
    ids: &[u32],
) -> AdapterResult<()> {
    base.set_filter_ids(ids);
    encoder.apply_filter(writer, ids).await
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
