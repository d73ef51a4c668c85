//! In-memory adapter that echoes every outbound frame back as incoming

use std::sync::Arc;

use async_trait::async_trait;
use canlink_core::{
    Adapter, AdapterError, AdapterInfo, AdapterResult, BaseAdapter, CancelToken, ChannelDepths,
    Config, Frame, FrameType, RegistryBuilder, RegistryError, DEFAULT_CLOSE_GRACE, SYSTEM_MSG,
    SYSTEM_MSG_FILTER,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const LOOPBACK: &str = "Loopback";

pub struct LoopbackAdapter {
    base: Arc<BaseAdapter>,
}

impl LoopbackAdapter {
    pub fn new(config: Config) -> Self {
        Self::with_depths(config, ChannelDepths::default())
    }

    pub fn with_depths(config: Config, depths: ChannelDepths) -> Self {
        Self {
            base: Arc::new(BaseAdapter::with_depths(LOOPBACK, config, depths)),
        }
    }
}

#[async_trait]
impl Adapter for LoopbackAdapter {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()> {
        self.base.mark_connected()?;
        let outbound = self
            .base
            .take_outbound()
            .ok_or(AdapterError::AlreadyConnected)?;
        self.base.spawn(echo_pump(self.base.clone(), outbound, ctx.child()));
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
        self.base.close(DEFAULT_CLOSE_GRACE).await;
        Ok(())
    }

    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()> {
        if self.base.is_closed() {
            return Err(AdapterError::Closed);
        }
        self.base.set_filter_ids(ids);
        Ok(())
    }
}

impl Drop for LoopbackAdapter {
    fn drop(&mut self) {
        self.base.shutdown().cancel();
    }
}

async fn echo_pump(base: Arc<BaseAdapter>, mut outbound: mpsc::Receiver<Frame>, halt: CancelToken) {
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

        match frame.id() {
            SYSTEM_MSG_FILTER => match frame.filter_ids() {
                Some(ids) => base.set_filter_ids(&ids),
                None => base.report(AdapterError::ProtocolDecode(
                    "filter update with a ragged payload".to_string(),
                )),
            },
            id if id >= SYSTEM_MSG => {}
            id if !base.accepts(id) => {}
            id => {
                let echo = if frame.is_remote() {
                    Frame::remote(id, frame.is_extended(), FrameType::INCOMING)
                } else {
                    Frame::incoming(id, frame.payload()).with_extended(frame.is_extended())
                };
                base.deliver(echo);
            }
        }
    }
    debug!(adapter = %base.name(), "Echo pump stopped");
}

pub(crate) fn register(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder.register(
        AdapterInfo::new(LOOPBACK, "In-memory echo adapter"),
        |config| Ok(Box::new(LoopbackAdapter::new(config)) as Box<dyn Adapter>),
    )
}
