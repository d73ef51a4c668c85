//! Adapter contract

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::{AdapterError, AdapterResult};
use crate::frame::Frame;

/// Uniform interface over every CAN transport
///
/// Lifecycle: constructed → `connect` → running → `close` → closed.
/// A closed adapter cannot be connected again.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Registry name of this adapter
    fn name(&self) -> &str;

    /// Open the transport and start the send and receive pumps.
    ///
    /// `ctx` bounds the handshake and is watched by the pumps alongside the
    /// adapter's own shutdown signal. A second call fails with `AlreadyConnected`.
    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()>;

    /// Outbound channel (application → wire)
    fn sender(&self) -> mpsc::Sender<Frame>;

    /// Inbound channel (wire → application). Only the first call returns it.
    fn recv(&self) -> Option<mpsc::Receiver<Frame>>;

    /// Asynchronous faults. Only the first call returns it.
    fn errors(&self) -> Option<mpsc::Receiver<AdapterError>>;

    /// Stop the pumps and release the transport.
    ///
    /// Safe to call any number of times from any task; returns within a short
    /// grace period even when the transport is unresponsive.
    async fn close(&self) -> AdapterResult<()>;

    /// Replace the acceptance filter. `[]` and `[0]` accept everything.
    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()>;
}
