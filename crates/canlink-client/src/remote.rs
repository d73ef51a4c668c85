//! Adapter reached through the gateway
//!
//! A [`RemoteAdapter`] opens one streaming session and from then on behaves
//! like any local adapter: frames go out through `sender()` and come back on
//! `recv()`. The session's error frames land on the error channel, its info
//! frames on the `on_message` callback.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_core::{
    Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, CancelToken, Config, Frame,
    RegistryBuilder, RegistryError, DEFAULT_CLOSE_GRACE, SYSTEM_MSG_ERROR, SYSTEM_MSG_INFO,
};
use canlink_gateway::{hello, read_message, write_message, Message, SENTINEL_ID};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::link_error;

/// Registry name of the remote adapter
pub const GATEWAY: &str = "Gateway";

/// How long the gateway has to open the remote adapter
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteAdapter {
    base: Arc<BaseAdapter>,
    path: PathBuf,
    remote: String,
}

impl RemoteAdapter {
    /// Adapter that asks the gateway at `path` for its `remote` adapter,
    /// configured with `config`
    pub fn new(path: impl Into<PathBuf>, remote: impl Into<String>, config: Config) -> Self {
        Self {
            base: Arc::new(BaseAdapter::new(GATEWAY, config)),
            path: path.into(),
            remote: remote.into(),
        }
    }

    /// Name of the adapter opened on the gateway side
    pub fn remote(&self) -> &str {
        &self.remote
    }

    async fn open(&self, ctx: &CancelToken) -> AdapterResult<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            AdapterError::TransportIo(format!("gateway {}: {}", self.path.display(), e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        // The live filter may have changed since construction
        let config = self.base.config().clone().with_can_filter(self.base.filter());
        write_message(&mut writer, &Message::Hello(hello(&self.remote, &config)))
            .await
            .map_err(link_error)?;

        let sentinel = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(AdapterError::Handshake("cancelled while opening session".to_string()))
            }
            reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader)) => reply,
        };
        match sentinel {
            Err(_) => Err(AdapterError::Handshake(format!(
                "no answer from gateway within {:?}",
                HANDSHAKE_TIMEOUT
            ))),
            Ok(Err(err)) => Err(link_error(err)),
            Ok(Ok(None)) => Err(AdapterError::Handshake(
                "gateway closed the session".to_string(),
            )),
            Ok(Ok(Some(Message::Frame(frame)))) if frame.id() == SENTINEL_ID => {
                if frame.data() == b"OK" {
                    Ok((reader, writer))
                } else {
                    Err(AdapterError::Handshake(format!(
                        "gateway refused {}: {}",
                        self.remote,
                        frame.text()
                    )))
                }
            }
            Ok(Ok(Some(other))) => Err(AdapterError::Handshake(format!(
                "expected session sentinel, got message type {}",
                other.msg_type()
            ))),
        }
    }
}

#[async_trait]
impl Adapter for RemoteAdapter {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()> {
        self.base.mark_connected()?;
        let outbound = self
            .base
            .take_outbound()
            .ok_or(AdapterError::AlreadyConnected)?;
        let (reader, writer) = self.open(ctx).await?;

        // Either pump ending takes the other one down
        let link = ctx.child();
        self.base
            .spawn(read_pump(self.base.clone(), reader, link.clone()));
        self.base
            .spawn(write_pump(self.base.clone(), writer, outbound, link));
        info!(adapter = %self.base.name(), remote = %self.remote, "Connected through gateway");
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
        self.base.close(DEFAULT_CLOSE_GRACE).await;
        Ok(())
    }

    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()> {
        if self.base.is_closed() {
            return Err(AdapterError::Closed);
        }
        self.base.set_filter_ids(ids);
        if self.base.is_connected() {
            self.base
                .sender()
                .send(Frame::filter_update(ids))
                .await
                .map_err(|_| AdapterError::Closed)?;
        }
        Ok(())
    }
}

impl Drop for RemoteAdapter {
    fn drop(&mut self) {
        self.base.shutdown().cancel();
    }
}

async fn read_pump(base: Arc<BaseAdapter>, mut reader: OwnedReadHalf, link: CancelToken) {
    let shutdown = base.shutdown().clone();
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = link.cancelled() => break,
            msg = read_message(&mut reader) => msg,
        };
        match msg {
            Ok(Some(Message::Frame(frame))) => match frame.id() {
                SYSTEM_MSG_ERROR => {
                    base.report(AdapterError::ProtocolDecode(format!("gateway: {}", frame.text())))
                }
                SYSTEM_MSG_INFO => base.info(&frame.text()),
                _ => {
                    base.deliver(frame);
                }
            },
            Ok(Some(other)) => {
                debug!(adapter = %base.name(), msg_type = other.msg_type(), "Ignoring message");
            }
            Ok(None) => {
                base.report(AdapterError::TransportIo(
                    "gateway closed the session".to_string(),
                ));
                break;
            }
            Err(err) => {
                base.report(link_error(err));
                break;
            }
        }
    }
    link.cancel();
    debug!(adapter = %base.name(), "Read pump stopped");
}

async fn write_pump(
    base: Arc<BaseAdapter>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    link: CancelToken,
) {
    let shutdown = base.shutdown().clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = link.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_message(&mut writer, &Message::Frame(frame)).await {
            warn!(adapter = %base.name(), error = %err, "Gateway write failed");
            base.report(link_error(err));
            break;
        }
    }
    link.cancel();
    // Dropping the write half ends the session on the gateway side
    drop(writer);
    debug!(adapter = %base.name(), "Write pump stopped");
}

/// Register [`RemoteAdapter`] as `Gateway`, opening `remote` on the gateway
/// listening at `path`
pub fn register(
    builder: &mut RegistryBuilder,
    path: impl Into<PathBuf>,
    remote: impl Into<String>,
) -> Result<(), RegistryError> {
    let path = path.into();
    let remote = remote.into();
    builder.register(
        AdapterInfo::new(GATEWAY, format!("{} shared through the local gateway", remote)),
        move |config| {
            Ok(Box::new(RemoteAdapter::new(path.clone(), remote.clone(), config)) as Box<dyn Adapter>)
        },
    )
}
