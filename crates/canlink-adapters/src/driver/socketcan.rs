//! Linux SocketCAN adapter
//!
//! Raw sockets have no async API, so the receive side is a blocking loop on
//! the blocking pool over a non-blocking socket; it checks the shutdown token
//! between reads. Writes hop onto the blocking pool one frame at a time.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_core::{
    is_accept_all, Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, CancelToken,
    Config, Frame, FrameType, RegistryBuilder, RegistryError, DEFAULT_CLOSE_GRACE,
    MAX_EXTENDED_ID, MAX_STANDARD_ID, SYSTEM_MSG, SYSTEM_MSG_FILTER,
};
use parking_lot::Mutex;
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id, Socket,
    SocketOptions, StandardId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SOCKETCAN: &str = "SocketCAN";

/// Sleep between reads of an empty socket
const IDLE_POLL: Duration = Duration::from_millis(1);
const EFF_FLAG: u32 = 0x8000_0000;

pub struct SocketCanAdapter {
    base: Arc<BaseAdapter>,
    socket: Mutex<Option<Arc<CanSocket>>>,
}

impl SocketCanAdapter {
    pub fn new(config: Config) -> Self {
        Self {
            base: Arc::new(BaseAdapter::new(SOCKETCAN, config)),
            socket: Mutex::new(None),
        }
    }
}

fn io_error(context: &str, err: std::io::Error) -> AdapterError {
    AdapterError::TransportIo(format!("{}: {}", context, err))
}

/// Kernel filters: one exact match per id, or none for accept-all
fn apply_filters(socket: &CanSocket, ids: &[u32], extended: bool) -> AdapterResult<()> {
    if is_accept_all(ids) {
        return socket
            .set_filter_accept_all()
            .map_err(|e| io_error("Failed to clear filters", e));
    }
    let filters: Vec<CanFilter> = ids
        .iter()
        .map(|&id| {
            if extended {
                CanFilter::new(id | EFF_FLAG, MAX_EXTENDED_ID | EFF_FLAG)
            } else {
                CanFilter::new(id, MAX_STANDARD_ID | EFF_FLAG)
            }
        })
        .collect();
    socket
        .set_filters(&filters)
        .map_err(|e| io_error("Failed to set filters", e))
}

fn to_socket_frame(frame: &Frame) -> AdapterResult<CanFrame> {
    let id: Id = if frame.is_extended() {
        ExtendedId::new(frame.id())
            .ok_or_else(|| AdapterError::InvalidConfig(format!("invalid extended id 0x{:X}", frame.id())))?
            .into()
    } else {
        u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(|| AdapterError::InvalidConfig(format!("invalid standard id 0x{:X}", frame.id())))?
            .into()
    };
    let built = if frame.is_remote() {
        CanFrame::new_remote(id, 0)
    } else {
        CanFrame::new(id, frame.data())
    };
    built.ok_or_else(|| {
        AdapterError::InvalidConfig(format!(
            "{} data bytes do not fit a classic CAN frame",
            frame.len()
        ))
    })
}

fn from_socket_frame(frame: &CanFrame) -> Frame {
    if frame.is_remote_frame() {
        Frame::remote(frame.raw_id(), frame.is_extended(), FrameType::INCOMING)
    } else {
        Frame::incoming(frame.raw_id(), frame.data().to_vec()).with_extended(frame.is_extended())
    }
}

#[async_trait]
impl Adapter for SocketCanAdapter {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()> {
        self.base.mark_connected()?;
        let config = self.base.config();
        let interface = config.port.clone();
        if interface.is_empty() {
            return Err(AdapterError::InvalidConfig("no CAN interface configured".to_string()));
        }

        let socket = CanSocket::open(&interface)
            .map_err(|e| io_error(&format!("Failed to open {}", interface), e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| io_error("Failed to set non-blocking", e))?;
        apply_filters(&socket, &self.base.filter(), config.use_extended_id)?;
        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());

        let outbound = self
            .base
            .take_outbound()
            .ok_or(AdapterError::AlreadyConnected)?;
        let halt = ctx.child();

        let reader = {
            let base = self.base.clone();
            let socket = socket.clone();
            let halt = halt.clone();
            tokio::task::spawn_blocking(move || read_loop(base, socket, halt))
        };
        self.base.track(reader);
        self.base.spawn(write_pump(self.base.clone(), socket, outbound, halt));

        info!(adapter = %self.base.name(), interface = %interface, "Connected");
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
            self.socket.lock().take();
            info!(adapter = %self.base.name(), "Closed");
        }
        Ok(())
    }

    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()> {
        if self.base.is_closed() {
            return Err(AdapterError::Closed);
        }
        self.base.set_filter_ids(ids);
        let socket = self.socket.lock().clone();
        match socket {
            Some(socket) => apply_filters(&socket, ids, self.base.config().use_extended_id),
            None => Ok(()),
        }
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        self.base.shutdown().cancel();
    }
}

fn read_loop(base: Arc<BaseAdapter>, socket: Arc<CanSocket>, halt: CancelToken) {
    let shutdown = base.shutdown().clone();
    while !shutdown.is_cancelled() && !halt.is_cancelled() {
        match socket.read_frame() {
            Ok(CanFrame::Error(_)) => {
                base.report(AdapterError::ProtocolDecode("bus error frame".to_string()));
            }
            Ok(frame) => {
                let frame = from_socket_frame(&frame);
                if base.config().debug {
                    debug!(adapter = %base.name(), frame = %frame, "Read");
                }
                base.deliver(frame);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(IDLE_POLL),
            Err(e) => {
                base.report(io_error("SocketCAN read failed", e));
                halt.cancel();
                break;
            }
        }
    }
    debug!(adapter = %base.name(), "Receive loop stopped");
}

async fn write_pump(
    base: Arc<BaseAdapter>,
    socket: Arc<CanSocket>,
    mut outbound: mpsc::Receiver<Frame>,
    halt: CancelToken,
) {
    let shutdown = base.shutdown().clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = halt.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = match frame.id() {
            SYSTEM_MSG_FILTER => match frame.filter_ids() {
                Some(ids) => {
                    base.set_filter_ids(&ids);
                    apply_filters(&socket, &ids, base.config().use_extended_id)
                }
                None => Err(AdapterError::ProtocolDecode(
                    "filter update with a ragged payload".to_string(),
                )),
            },
            id if id >= SYSTEM_MSG => Ok(()),
            _ => match to_socket_frame(&frame) {
                Ok(raw) => {
                    let socket = socket.clone();
                    match tokio::task::spawn_blocking(move || socket.write_frame(&raw)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => Err(
                            AdapterError::Backpressure(format!("transmit queue full, 0x{:X} dropped", frame.id())),
                        ),
                        Ok(Err(e)) => Err(io_error("SocketCAN write failed", e)),
                        Err(e) => Err(AdapterError::Fatal(format!("write task failed: {}", e))),
                    }
                }
                Err(e) => Err(e),
            },
        };

        if let Err(err) = result {
            let fatal = err.is_fatal();
            if fatal {
                warn!(adapter = %base.name(), error = %err, "Write failed");
            }
            base.report(err);
            if fatal {
                halt.cancel();
                break;
            }
        }
    }
    debug!(adapter = %base.name(), "Send pump stopped");
}

pub(crate) fn register(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder.register(
        AdapterInfo::new(SOCKETCAN, "Linux SocketCAN raw socket (port = interface name)"),
        |config| Ok(Box::new(SocketCanAdapter::new(config)) as Box<dyn Adapter>),
    )
}
