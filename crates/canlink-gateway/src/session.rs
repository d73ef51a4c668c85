//! One streaming session: a client connection that owns one adapter
//!
//! Lifecycle:
//!
//! ```text
//! hello ─► lookup ─► construct + connect ─► sentinel "OK" ─► streaming ─► close
//!                  └──────── failure ─────► sentinel <reason> ─► end
//! ```
//!
//! While streaming, two pumps bridge the client and the adapter. Either one
//! ending cancels the session token, which stops the other; the adapter is
//! closed exactly once after both have returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use canlink_core::{Adapter, AdapterError, CancelToken, Frame, Registry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::metadata;
use crate::wire::{error_sentinel, read_message, ready_sentinel, write_message, Message};

/// Depth of the side channel carrying synthetic frames to the client
const NOTICE_DEPTH: usize = 32;

/// Longest a client-requested filter change may hold up the client reader
const FILTER_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Session {
    id: Uuid,
    registry: Arc<Registry>,
    cancel: CancelToken,
}

impl Session {
    /// `cancel` should be a child of the server's shutdown token
    pub fn new(registry: Arc<Registry>, cancel: CancelToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session to completion. `reader` is positioned after the hello.
    pub async fn run<R, W>(self, meta: BTreeMap<String, String>, reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_DEPTH);
        // Fatal faults that overflowed the error channel; the first one ends the session
        let (fatal_tx, fatal_rx) = mpsc::channel(1);

        let adapter = match self.open(&meta, &notice_tx, fatal_tx).await {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(session = %self.id, error = %err, "Session rejected");
                let _ = write_message(&mut writer, &Message::Frame(error_sentinel(&err))).await;
                return;
            }
        };

        if let Err(err) = write_message(&mut writer, &Message::Frame(ready_sentinel())).await {
            warn!(session = %self.id, error = %err, "Client gone before streaming");
            let _ = adapter.close().await;
            return;
        }
        info!(session = %self.id, adapter = %adapter.name(), "Streaming");

        let frames = adapter.recv();
        let errors = adapter.errors();
        let inbound = Inbound {
            frames,
            errors,
            notices: notice_rx,
            fatal: fatal_rx,
        };
        let (to_client, to_adapter) = tokio::join!(
            to_client(self.id, writer, inbound, self.cancel.clone()),
            to_adapter(self.id, reader, adapter.clone(), notice_tx, self.cancel.clone()),
        );
        for result in [to_client, to_adapter] {
            if let Err(err) = result {
                debug!(session = %self.id, error = %err, "Bridge ended with error");
            }
        }

        if let Err(err) = adapter.close().await {
            warn!(session = %self.id, error = %err, "Adapter close failed");
        }
        info!(session = %self.id, "Session closed");
    }

    async fn open(
        &self,
        meta: &BTreeMap<String, String>,
        notices: &mpsc::Sender<Frame>,
        fatal: mpsc::Sender<Frame>,
    ) -> GatewayResult<Arc<dyn Adapter>> {
        let (name, config) = metadata::session_config(meta)?;
        info!(session = %self.id, adapter = %name, port = %config.port, "Opening adapter");

        // Banners and faults the error channel could not take reach the client too
        let config = {
            let info_tx = notices.clone();
            let error_tx = notices.clone();
            config
                .on_message(move |text| {
                    let _ = info_tx.try_send(Frame::system_info(text));
                })
                .on_error(move |err| {
                    let frame = Frame::system_error(err);
                    let _ = if err.is_fatal() {
                        fatal.try_send(frame)
                    } else {
                        error_tx.try_send(frame)
                    };
                })
        };

        let adapter: Arc<dyn Adapter> = Arc::from(self.registry.new_adapter(&name, config)?);
        if let Err(err) = adapter.connect(&self.cancel).await {
            let _ = adapter.close().await;
            return Err(err.into());
        }
        Ok(adapter)
    }
}

/// Everything flowing from the adapter side towards the client
struct Inbound {
    frames: Option<mpsc::Receiver<Frame>>,
    errors: Option<mpsc::Receiver<AdapterError>>,
    notices: mpsc::Receiver<Frame>,
    fatal: mpsc::Receiver<Frame>,
}

/// Adapter → client. Adapter faults become system-error frames; a fatal one
/// is the last frame of the session, whichever path it arrived on.
async fn to_client<W>(
    session: Uuid,
    mut writer: W,
    inbound: Inbound,
    cancel: CancelToken,
) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let result = pump_to_client(session, &mut writer, inbound, &cancel).await;
    cancel.cancel();
    result
}

async fn pump_to_client<W>(
    session: Uuid,
    writer: &mut W,
    inbound: Inbound,
    cancel: &CancelToken,
) -> GatewayResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let Inbound {
        frames,
        errors,
        mut notices,
        mut fatal,
    } = inbound;
    let mut frames = frames.ok_or(GatewayError::Adapter(AdapterError::Closed))?;
    let mut errors = errors.unwrap_or_else(|| mpsc::channel(1).1);
    let mut errors_open = true;

    loop {
        let (frame, last) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            Some(notice) = notices.recv() => (notice, false),
            err = errors.recv(), if errors_open => match err {
                Some(err) => {
                    let fatal = err.is_fatal();
                    if fatal {
                        warn!(session = %session, error = %err, "Adapter failed");
                    }
                    (Frame::system_error(&err), fatal)
                }
                None => {
                    errors_open = false;
                    continue;
                }
            },
            Some(frame) = fatal.recv() => {
                warn!(session = %session, error = %frame.text(), "Adapter failed");
                (frame, true)
            }
            frame = frames.recv() => match frame {
                Some(frame) => (frame, false),
                None => return Ok(()),
            },
        };
        write_message(writer, &Message::Frame(frame)).await?;
        if last {
            return Ok(());
        }
    }
}

/// Client → adapter. Never blocks on a full adapter queue: the frame is
/// dropped and the client is told.
async fn to_adapter<R>(
    session: Uuid,
    mut reader: R,
    adapter: Arc<dyn Adapter>,
    notices: mpsc::Sender<Frame>,
    cancel: CancelToken,
) -> GatewayResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let result = pump_to_adapter(session, &mut reader, adapter.as_ref(), &notices, &cancel).await;
    cancel.cancel();
    result
}

async fn pump_to_adapter<R>(
    session: Uuid,
    reader: &mut R,
    adapter: &dyn Adapter,
    notices: &mpsc::Sender<Frame>,
    cancel: &CancelToken,
) -> GatewayResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let sender = adapter.sender();
    let notify = |frame: Frame| {
        if notices.try_send(frame).is_err() {
            warn!(session = %session, "Notice queue full, client notification dropped");
        }
    };

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = read_message(reader) => msg?,
        };
        let frame = match msg {
            None => {
                debug!(session = %session, "Client closed the stream");
                return Ok(());
            }
            Some(Message::Frame(frame)) => frame,
            Some(other) => {
                debug!(session = %session, msg_type = other.msg_type(), "Ignoring message in session");
                continue;
            }
        };

        // Inline so the filter applies before any frame sent after it
        if let Some(ids) = frame.filter_ids() {
            match tokio::time::timeout(FILTER_TIMEOUT, adapter.set_filter(&ids)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => notify(Frame::system_error(&err)),
                Err(_) => notify(Frame::system_error(AdapterError::Timeout(format!(
                    "filter update not applied within {:?}",
                    FILTER_TIMEOUT
                )))),
            }
            continue;
        }
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => notify(Frame::system_error(AdapterError::Backpressure(
                format!("outbound queue full, 0x{:X} dropped", frame.id()),
            ))),
            Err(TrySendError::Closed(_)) => {
                return Err(GatewayError::Adapter(AdapterError::Closed))
            }
        }
    }
}
