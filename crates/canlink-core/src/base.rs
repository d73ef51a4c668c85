//! Shared channel plumbing and shutdown for every adapter
//!
//! A transport embeds a [`BaseAdapter`] and only has to provide its two pumps.
//! The base owns the bounded outbound, inbound and error channels, the
//! shutdown token and the pump join handles.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{is_accept_all, Config};
use crate::error::{AdapterError, AdapterResult};
use crate::frame::Frame;

/// How long `close` waits for pumps before aborting them
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Channel depths for one adapter
#[derive(Debug, Clone, Copy)]
pub struct ChannelDepths {
    pub outbound: usize,
    pub inbound: usize,
    pub errors: usize,
}

impl Default for ChannelDepths {
    fn default() -> Self {
        Self {
            outbound: 64,
            inbound: 64,
            errors: 5,
        }
    }
}

/// Channels, shutdown signal and pump handles of one adapter instance
pub struct BaseAdapter {
    name: String,
    config: Config,
    filter: RwLock<Vec<u32>>,
    send_tx: mpsc::Sender<Frame>,
    send_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    recv_tx: RwLock<Option<mpsc::Sender<Frame>>>,
    recv_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    err_tx: RwLock<Option<mpsc::Sender<AdapterError>>>,
    err_rx: Mutex<Option<mpsc::Receiver<AdapterError>>>,
    shutdown: CancelToken,
    connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BaseAdapter {
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        Self::with_depths(name, config, ChannelDepths::default())
    }

    pub fn with_depths(name: impl Into<String>, config: Config, depths: ChannelDepths) -> Self {
        let (send_tx, send_rx) = mpsc::channel(depths.outbound.max(1));
        let (recv_tx, recv_rx) = mpsc::channel(depths.inbound.max(1));
        let (err_tx, err_rx) = mpsc::channel(depths.errors.max(1));
        let filter = config.can_filter.clone();

        Self {
            name: name.into(),
            config,
            filter: RwLock::new(filter),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx: RwLock::new(Some(recv_tx)),
            recv_rx: Mutex::new(Some(recv_rx)),
            err_tx: RwLock::new(Some(err_tx)),
            err_rx: Mutex::new(Some(err_rx)),
            shutdown: CancelToken::new(),
            connected: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adapter-wide shutdown signal
    pub fn shutdown(&self) -> &CancelToken {
        &self.shutdown
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Outbound channel (application → wire)
    pub fn sender(&self) -> mpsc::Sender<Frame> {
        self.send_tx.clone()
    }

    /// Inbound channel (wire → application). Only the first caller gets it.
    pub fn take_recv(&self) -> Option<mpsc::Receiver<Frame>> {
        self.recv_rx.lock().take()
    }

    /// Error channel. Only the first caller gets it.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<AdapterError>> {
        self.err_rx.lock().take()
    }

    /// Consumer side of the outbound channel, handed to the send pump
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Frame>> {
        self.send_rx.lock().take()
    }

    /// Transition constructed → running. Rejects a second connect and closed adapters.
    pub fn mark_connected(&self) -> AdapterResult<()> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyConnected);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    /// Current acceptance filter
    pub fn filter(&self) -> Vec<u32> {
        self.filter.read().clone()
    }

    pub fn set_filter_ids(&self, ids: &[u32]) {
        *self.filter.write() = ids.to_vec();
    }

    /// Exact software filter check against the current filter list
    pub fn accepts(&self, id: u32) -> bool {
        let filter = self.filter.read();
        is_accept_all(&filter) || filter.contains(&id)
    }

    /// Hand a frame to the consumer without blocking.
    ///
    /// A full inbound channel drops the frame and reports `DroppedFrame`.
    /// Returns `true` when the frame was queued.
    pub fn deliver(&self, frame: Frame) -> bool {
        let guard = self.recv_tx.read();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                drop(guard);
                self.report(AdapterError::DroppedFrame { id: frame.id() });
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(adapter = %self.name, "Inbound consumer gone, frame discarded");
                false
            }
        }
    }

    /// Report an asynchronous fault without blocking.
    ///
    /// Falls back to the `on_error` callback when the error channel is full,
    /// closed or already torn down.
    pub fn report(&self, err: AdapterError) {
        if self.config.debug {
            debug!(adapter = %self.name, error = %err, "Adapter fault");
        }
        let guard = self.err_tx.read();
        let result = match guard.as_ref() {
            Some(tx) => tx.try_send(err),
            None => Err(TrySendError::Closed(err)),
        };
        drop(guard);
        match result {
            Ok(()) => {}
            Err(TrySendError::Full(err)) | Err(TrySendError::Closed(err)) => {
                self.config.emit_error(&err);
            }
        }
    }

    /// Informational text (banners, firmware version)
    pub fn info(&self, text: &str) {
        self.config.emit_message(text);
    }

    /// Spawn a pump owned by this adapter
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks.lock().push(handle);
    }

    /// Track a pump spawned elsewhere (e.g. `spawn_blocking`)
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Fire shutdown exactly once and join the pumps within `grace`.
    ///
    /// Returns `false` when another caller already closed the adapter.
    pub async fn close(&self, grace: Duration) -> bool {
        if !self.shutdown.cancel() {
            return false;
        }

        let handles = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(adapter = %self.name, error = %e, "Pump panicked"),
                Err(_) => {
                    warn!(adapter = %self.name, "Pump did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }

        // Dropping the producers lets consumers see end-of-stream.
        self.recv_tx.write().take();
        self.err_tx.write().take();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn small(inbound: usize, errors: usize) -> ChannelDepths {
        ChannelDepths {
            outbound: 4,
            inbound,
            errors,
        }
    }

    #[tokio::test]
    async fn test_drop_and_report_when_inbound_full() {
        let base = BaseAdapter::with_depths("test", Config::default(), small(2, 8));
        let mut rx = base.take_recv().unwrap();
        let mut errors = base.take_errors().unwrap();

        for id in 1..=5u32 {
            base.deliver(Frame::incoming(id, vec![id as u8]));
        }

        // Delivered frames keep their order, nothing is duplicated
        assert_eq!(rx.recv().await.unwrap().id(), 1);
        assert_eq!(rx.recv().await.unwrap().id(), 2);
        assert!(rx.try_recv().is_err());

        // One report per dropped frame
        let mut dropped = Vec::new();
        while let Ok(err) = errors.try_recv() {
            dropped.push(err);
        }
        assert_eq!(
            dropped,
            vec![
                AdapterError::DroppedFrame { id: 3 },
                AdapterError::DroppedFrame { id: 4 },
                AdapterError::DroppedFrame { id: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn test_error_overflow_goes_to_callback() {
        let overflow = Arc::new(AtomicUsize::new(0));
        let seen = overflow.clone();
        let config = Config::default().on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let base = BaseAdapter::with_depths("test", config, small(1, 1));
        let _errors = base.take_errors().unwrap();

        base.report(AdapterError::Backpressure("one".into()));
        base.report(AdapterError::Backpressure("two".into()));
        base.report(AdapterError::Backpressure("three".into()));

        assert_eq!(overflow.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_exactly_once() {
        let base = Arc::new(BaseAdapter::new("test", Config::default()));
        base.mark_connected().unwrap();
        let stop = base.shutdown().clone();
        base.spawn(async move { stop.cancelled().await });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let base = base.clone();
            handles.push(tokio::spawn(async move {
                base.close(DEFAULT_CLOSE_GRACE).await
            }));
        }
        let mut closed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(matches!(base.mark_connected(), Err(AdapterError::Closed)));
    }

    #[tokio::test]
    async fn test_close_aborts_hung_pump() {
        let base = BaseAdapter::new("test", Config::default());
        base.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let started = tokio::time::Instant::now();
        assert!(base.close(Duration::from_millis(20)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let base = BaseAdapter::new("test", Config::default());
        base.mark_connected().unwrap();
        assert_eq!(base.mark_connected(), Err(AdapterError::AlreadyConnected));
    }

    #[test]
    fn test_software_filter() {
        let base = BaseAdapter::new("test", Config::default().with_can_filter(vec![0x7E8]));
        assert!(base.accepts(0x7E8));
        assert!(!base.accepts(0x7E0));
        base.set_filter_ids(&[0]);
        assert!(base.accepts(0x7E0));
    }
}
