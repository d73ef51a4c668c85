//! J2534 (PassThru) boundary
//!
//! A binding to a vendor PassThru library implements [`PassThruApi`]; this
//! module owns the status code table, the mapping onto [`AdapterError`] and
//! the adapter that drives the blocking calls. No binding ships with canlink,
//! so nothing here is registered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use canlink_codec::AcceptanceFilter;
use canlink_core::{
    is_accept_all, Adapter, AdapterError, AdapterResult, BaseAdapter, CancelToken, Config, Frame,
    DEFAULT_CLOSE_GRACE, MAX_EXTENDED_ID, MAX_STANDARD_ID, SYSTEM_MSG,
    SYSTEM_MSG_FILTER,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `CAN_29BIT_ID` in `TxFlags` / `RxStatus`
pub const CAN_29BIT_ID: u32 = 0x0000_0100;
/// Most pass filters a channel accepts
pub const MAX_FILTERS: usize = 10;

const READ_TIMEOUT: Duration = Duration::from_millis(20);
/// Pause after a read error that neither clears nor ends the channel
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_ATTEMPTS: usize = 3;

/// Return codes of the PassThru API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThruStatus {
    NoError,
    NotSupported,
    InvalidChannelId,
    InvalidProtocolId,
    NullParameter,
    InvalidIoctlValue,
    InvalidFlags,
    Failed,
    DeviceNotConnected,
    Timeout,
    InvalidMsg,
    InvalidTimeInterval,
    ExceededLimit,
    InvalidMsgId,
    DeviceInUse,
    InvalidIoctlId,
    BufferEmpty,
    BufferFull,
    BufferOverflow,
    PinInvalid,
    ChannelInUse,
    MsgProtocolId,
    InvalidFilterId,
    NoFlowControl,
    NotUnique,
    InvalidBaudrate,
    InvalidDeviceId,
    Other(u32),
}

const STATUS_TABLE: [(u32, PassThruStatus, &str); 27] = [
    (0x00, PassThruStatus::NoError, "STATUS_NOERROR"),
    (0x01, PassThruStatus::NotSupported, "ERR_NOT_SUPPORTED"),
    (0x02, PassThruStatus::InvalidChannelId, "ERR_INVALID_CHANNEL_ID"),
    (0x03, PassThruStatus::InvalidProtocolId, "ERR_INVALID_PROTOCOL_ID"),
    (0x04, PassThruStatus::NullParameter, "ERR_NULL_PARAMETER"),
    (0x05, PassThruStatus::InvalidIoctlValue, "ERR_INVALID_IOCTL_VALUE"),
    (0x06, PassThruStatus::InvalidFlags, "ERR_INVALID_FLAGS"),
    (0x07, PassThruStatus::Failed, "ERR_FAILED"),
    (0x08, PassThruStatus::DeviceNotConnected, "ERR_DEVICE_NOT_CONNECTED"),
    (0x09, PassThruStatus::Timeout, "ERR_TIMEOUT"),
    (0x0A, PassThruStatus::InvalidMsg, "ERR_INVALID_MSG"),
    (0x0B, PassThruStatus::InvalidTimeInterval, "ERR_INVALID_TIME_INTERVAL"),
    (0x0C, PassThruStatus::ExceededLimit, "ERR_EXCEEDED_LIMIT"),
    (0x0D, PassThruStatus::InvalidMsgId, "ERR_INVALID_MSG_ID"),
    (0x0E, PassThruStatus::DeviceInUse, "ERR_DEVICE_IN_USE"),
    (0x0F, PassThruStatus::InvalidIoctlId, "ERR_INVALID_IOCTL_ID"),
    (0x10, PassThruStatus::BufferEmpty, "ERR_BUFFER_EMPTY"),
    (0x11, PassThruStatus::BufferFull, "ERR_BUFFER_FULL"),
    (0x12, PassThruStatus::BufferOverflow, "ERR_BUFFER_OVERFLOW"),
    (0x13, PassThruStatus::PinInvalid, "ERR_PIN_INVALID"),
    (0x14, PassThruStatus::ChannelInUse, "ERR_CHANNEL_IN_USE"),
    (0x15, PassThruStatus::MsgProtocolId, "ERR_MSG_PROTOCOL_ID"),
    (0x16, PassThruStatus::InvalidFilterId, "ERR_INVALID_FILTER_ID"),
    (0x17, PassThruStatus::NoFlowControl, "ERR_NO_FLOW_CONTROL"),
    (0x18, PassThruStatus::NotUnique, "ERR_NOT_UNIQUE"),
    (0x19, PassThruStatus::InvalidBaudrate, "ERR_INVALID_BAUDRATE"),
    (0x1A, PassThruStatus::InvalidDeviceId, "ERR_INVALID_DEVICE_ID"),
];

impl PassThruStatus {
    pub fn from_code(code: u32) -> Self {
        STATUS_TABLE
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, status, _)| *status)
            .unwrap_or(PassThruStatus::Other(code))
    }

    pub fn code(self) -> u32 {
        match self {
            PassThruStatus::Other(code) => code,
            status => STATUS_TABLE
                .iter()
                .find(|(_, s, _)| *s == status)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    /// Error class, `None` for `STATUS_NOERROR`
    pub fn kind(self) -> Option<PassThruErrorKind> {
        use PassThruStatus::*;
        let kind = match self {
            NoError => return None,
            NotSupported => PassThruErrorKind::NotSupported,
            InvalidChannelId | InvalidProtocolId | NullParameter | InvalidIoctlValue
            | InvalidFlags | InvalidMsg | InvalidTimeInterval | InvalidMsgId | InvalidIoctlId
            | PinInvalid | MsgProtocolId | InvalidFilterId | InvalidBaudrate | InvalidDeviceId => {
                PassThruErrorKind::InvalidParameter
            }
            Timeout | BufferEmpty | BufferFull => PassThruErrorKind::Transient,
            DeviceNotConnected => PassThruErrorKind::DeviceNotConnected,
            Failed | ExceededLimit | DeviceInUse | BufferOverflow | ChannelInUse
            | NoFlowControl | NotUnique | Other(_) => PassThruErrorKind::Other,
        };
        Some(kind)
    }

    /// `Ok` for `STATUS_NOERROR`, otherwise an error naming `call`
    pub fn check(self, call: &'static str) -> Result<(), PassThruError> {
        match self {
            PassThruStatus::NoError => Ok(()),
            status => Err(PassThruError { call, status }),
        }
    }
}

impl fmt::Display for PassThruStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = STATUS_TABLE
            .iter()
            .find(|(_, s, _)| s == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("ERR_UNKNOWN");
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}

/// How the core treats a PassThru failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThruErrorKind {
    NotSupported,
    InvalidParameter,
    /// Timeout, buffer empty or full: retried
    Transient,
    /// The device is gone: fatal
    DeviceNotConnected,
    Other,
}

/// A failed PassThru call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed: {status}")]
pub struct PassThruError {
    pub call: &'static str,
    pub status: PassThruStatus,
}

impl PassThruError {
    pub fn kind(&self) -> PassThruErrorKind {
        self.status.kind().unwrap_or(PassThruErrorKind::Other)
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == PassThruErrorKind::Transient
    }
}

impl From<PassThruError> for AdapterError {
    fn from(err: PassThruError) -> Self {
        match err.kind() {
            PassThruErrorKind::NotSupported => AdapterError::Unsupported(err.to_string()),
            PassThruErrorKind::InvalidParameter => AdapterError::InvalidConfig(err.to_string()),
            PassThruErrorKind::Transient => AdapterError::Timeout(err.to_string()),
            PassThruErrorKind::DeviceNotConnected => AdapterError::Fatal(err.to_string()),
            PassThruErrorKind::Other => AdapterError::TransportIo(err.to_string()),
        }
    }
}

/// `PASSTHRU_MSG` for the CAN protocol: 4-byte big-endian id, then data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassThruMsg {
    pub rx_status: u32,
    pub tx_flags: u32,
    pub timestamp: u32,
    pub data: Vec<u8>,
}

impl PassThruMsg {
    pub fn from_frame(frame: &Frame) -> Self {
        let mut data = Vec::with_capacity(4 + frame.len());
        data.extend_from_slice(&frame.id().to_be_bytes());
        data.extend_from_slice(frame.data());
        Self {
            tx_flags: if frame.is_extended() { CAN_29BIT_ID } else { 0 },
            data,
            ..Default::default()
        }
    }

    /// Mask/pattern message for a pass filter
    pub fn filter_word(value: u32, extended: bool) -> Self {
        Self {
            tx_flags: if extended { CAN_29BIT_ID } else { 0 },
            data: value.to_be_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn to_frame(&self) -> Option<Frame> {
        if self.data.len() < 4 {
            return None;
        }
        let (id, data) = self.data.split_at(4);
        let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        let extended = self.rx_status & CAN_29BIT_ID != 0;
        Some(Frame::incoming(id, data.to_vec()).with_extended(extended))
    }
}

/// Blocking calls of a PassThru binding, one device and one CAN channel
pub trait PassThruApi: Send + Sync + 'static {
    /// `PassThruOpen` + `PassThruConnect`
    fn open(&self, port: &str, bitrate: u32, extended: bool) -> Result<(), PassThruError>;
    fn read_msgs(&self, max: usize, timeout: Duration) -> Result<Vec<PassThruMsg>, PassThruError>;
    fn write_msgs(&self, msgs: &[PassThruMsg], timeout: Duration) -> Result<usize, PassThruError>;
    /// `PASS_FILTER` with the given mask and pattern
    fn start_pass_filter(&self, mask: &PassThruMsg, pattern: &PassThruMsg) -> Result<(), PassThruError>;
    fn clear_filters(&self) -> Result<(), PassThruError>;
    /// `PassThruDisconnect` + `PassThruClose`
    fn close(&self) -> Result<(), PassThruError>;
}

/// Mask/pattern pairs for `ids`: exact matches while they fit, one shared
/// window otherwise
fn pass_filters(ids: &[u32], extended: bool) -> Vec<(u32, u32)> {
    let width = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
    if is_accept_all(ids) {
        return vec![(0, 0)];
    }
    if ids.len() <= MAX_FILTERS {
        return ids.iter().map(|&id| (width, id & width)).collect();
    }
    let window = AcceptanceFilter::compute(ids, extended);
    vec![(window.must_match_mask(), window.code)]
}

fn install_filters<A: PassThruApi>(api: &A, ids: &[u32], extended: bool) -> Result<(), PassThruError> {
    api.clear_filters()?;
    for (mask, pattern) in pass_filters(ids, extended) {
        api.start_pass_filter(
            &PassThruMsg::filter_word(mask, extended),
            &PassThruMsg::filter_word(pattern, extended),
        )?;
    }
    Ok(())
}

async fn blocking<A, T, F>(api: &Arc<A>, call: F) -> AdapterResult<T>
where
    A: PassThruApi,
    T: Send + 'static,
    F: FnOnce(&A) -> Result<T, PassThruError> + Send + 'static,
{
    let api = api.clone();
    match tokio::task::spawn_blocking(move || call(&api)).await {
        Ok(result) => result.map_err(AdapterError::from),
        Err(e) => Err(AdapterError::Fatal(format!("PassThru task failed: {}", e))),
    }
}

/// Adapter over a PassThru binding
pub struct PassThruAdapter<A: PassThruApi> {
    base: Arc<BaseAdapter>,
    api: Arc<A>,
}

impl<A: PassThruApi> PassThruAdapter<A> {
    pub fn new(name: impl Into<String>, config: Config, api: A) -> Self {
        Self {
            base: Arc::new(BaseAdapter::new(name, config)),
            api: Arc::new(api),
        }
    }
}

#[async_trait]
impl<A: PassThruApi> Adapter for PassThruAdapter<A> {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn connect(&self, ctx: &CancelToken) -> AdapterResult<()> {
        self.base.mark_connected()?;
        let config = self.base.config();
        let port = config.port.clone();
        let bitrate = (config.can_rate * 1000.0).round() as u32;
        let extended = config.use_extended_id;
        let ids = self.base.filter();
        blocking(&self.api, move |api| {
            api.open(&port, bitrate, extended)?;
            install_filters(api, &ids, extended)
        })
        .await?;

        let outbound = self
            .base
            .take_outbound()
            .ok_or(AdapterError::AlreadyConnected)?;
        let halt = ctx.child();
        let reader = {
            let base = self.base.clone();
            let api = self.api.clone();
            let halt = halt.clone();
            tokio::task::spawn_blocking(move || read_loop(base, api, halt))
        };
        self.base.track(reader);
        self.base.spawn(write_pump(self.base.clone(), self.api.clone(), outbound, halt));

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
        let connected = self.base.is_connected();
        if !self.base.close(DEFAULT_CLOSE_GRACE).await || !connected {
            return Ok(());
        }
        if let Err(e) = blocking(&self.api, |api| api.close()).await {
            warn!(adapter = %self.base.name(), error = %e, "PassThru close failed");
        }
        info!(adapter = %self.base.name(), "Closed");
        Ok(())
    }

    async fn set_filter(&self, ids: &[u32]) -> AdapterResult<()> {
        if self.base.is_closed() {
            return Err(AdapterError::Closed);
        }
        self.base.set_filter_ids(ids);
        if !self.base.is_connected() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let extended = self.base.config().use_extended_id;
        blocking(&self.api, move |api| install_filters(api, &ids, extended)).await
    }
}

impl<A: PassThruApi> Drop for PassThruAdapter<A> {
    fn drop(&mut self) {
        self.base.shutdown().cancel();
    }
}

fn read_loop<A: PassThruApi>(base: Arc<BaseAdapter>, api: Arc<A>, halt: CancelToken) {
    let shutdown = base.shutdown().clone();
    while !shutdown.is_cancelled() && !halt.is_cancelled() {
        match api.read_msgs(16, READ_TIMEOUT) {
            Ok(msgs) => {
                for msg in msgs {
                    match msg.to_frame() {
                        Some(frame) => {
                            base.deliver(frame);
                        }
                        None => base.report(AdapterError::ProtocolDecode(format!(
                            "PassThru message of {} bytes",
                            msg.data.len()
                        ))),
                    }
                }
            }
            Err(e) if e.is_transient() => {}
            Err(e) => {
                let err = AdapterError::from(e);
                let fatal = err.is_fatal();
                base.report(err);
                if fatal {
                    halt.cancel();
                    break;
                }
                std::thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
    debug!(adapter = %base.name(), "Receive loop stopped");
}

async fn write_pump<A: PassThruApi>(
    base: Arc<BaseAdapter>,
    api: Arc<A>,
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
                    let extended = base.config().use_extended_id;
                    blocking(&api, move |api| install_filters(api, &ids, extended)).await
                }
                None => Err(AdapterError::ProtocolDecode(
                    "filter update with a ragged payload".to_string(),
                )),
            },
            id if id >= SYSTEM_MSG => Ok(()),
            _ => write_with_retry(&api, &frame).await,
        };

        if let Err(err) = result {
            let fatal = err.is_fatal();
            base.report(err);
            if fatal {
                halt.cancel();
                break;
            }
        }
    }
    debug!(adapter = %base.name(), "Send pump stopped");
}

async fn write_with_retry<A: PassThruApi>(api: &Arc<A>, frame: &Frame) -> AdapterResult<()> {
    let msg = PassThruMsg::from_frame(frame);
    for _ in 0..WRITE_ATTEMPTS {
        let attempt = msg.clone();
        let api = api.clone();
        let result = tokio::task::spawn_blocking(move || api.write_msgs(&[attempt], WRITE_TIMEOUT))
            .await
            .map_err(|e| AdapterError::Fatal(format!("PassThru task failed: {}", e)))?;
        match result {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(AdapterError::Backpressure(format!(
        "PassThru transmit buffer full, 0x{:X} dropped",
        frame.id()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        reads: Mutex<VecDeque<Result<Vec<PassThruMsg>, PassThruError>>>,
        written: Mutex<Vec<PassThruMsg>>,
        filters: Mutex<Vec<(PassThruMsg, PassThruMsg)>>,
        closed: Mutex<bool>,
        /// Returned by every read once `reads` runs dry
        stuck: Mutex<Option<PassThruStatus>>,
    }

    impl PassThruApi for FakeApi {
        fn open(&self, _port: &str, _bitrate: u32, _extended: bool) -> Result<(), PassThruError> {
            Ok(())
        }

        fn read_msgs(&self, _max: usize, timeout: Duration) -> Result<Vec<PassThruMsg>, PassThruError> {
            if let Some(result) = self.reads.lock().pop_front() {
                return result;
            }
            match *self.stuck.lock() {
                Some(status) => status.check("PassThruReadMsgs").map(|_| Vec::new()),
                None => {
                    std::thread::sleep(timeout);
                    PassThruStatus::BufferEmpty.check("PassThruReadMsgs").map(|_| Vec::new())
                }
            }
        }

        fn write_msgs(&self, msgs: &[PassThruMsg], _timeout: Duration) -> Result<usize, PassThruError> {
            self.written.lock().extend_from_slice(msgs);
            Ok(msgs.len())
        }

        fn start_pass_filter(&self, mask: &PassThruMsg, pattern: &PassThruMsg) -> Result<(), PassThruError> {
            self.filters.lock().push((mask.clone(), pattern.clone()));
            Ok(())
        }

        fn clear_filters(&self) -> Result<(), PassThruError> {
            self.filters.lock().clear();
            Ok(())
        }

        fn close(&self) -> Result<(), PassThruError> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    fn rx(id: u32, data: &[u8]) -> PassThruMsg {
        PassThruMsg::from_frame(&Frame::incoming(id, data.to_vec()))
    }

    #[test]
    fn test_status_table() {
        assert_eq!(PassThruStatus::from_code(0x08), PassThruStatus::DeviceNotConnected);
        assert_eq!(PassThruStatus::from_code(0x99), PassThruStatus::Other(0x99));
        assert_eq!(PassThruStatus::BufferFull.code(), 0x11);
        assert_eq!(PassThruStatus::NoError.kind(), None);
        assert_eq!(PassThruStatus::Timeout.to_string(), "ERR_TIMEOUT (0x09)");
    }

    #[test]
    fn test_error_mapping() {
        let map = |status: PassThruStatus| AdapterError::from(PassThruError { call: "PassThruIoctl", status });
        assert!(matches!(map(PassThruStatus::NotSupported), AdapterError::Unsupported(_)));
        assert!(matches!(map(PassThruStatus::InvalidBaudrate), AdapterError::InvalidConfig(_)));
        assert!(matches!(map(PassThruStatus::BufferEmpty), AdapterError::Timeout(_)));
        assert!(map(PassThruStatus::DeviceNotConnected).is_fatal());
        assert!(matches!(map(PassThruStatus::Other(0x42)), AdapterError::TransportIo(_)));
    }

    #[test]
    fn test_pass_filters() {
        assert_eq!(pass_filters(&[], false), vec![(0, 0)]);
        assert_eq!(pass_filters(&[0x7E8, 0x7E9], false), vec![(0x7FF, 0x7E8), (0x7FF, 0x7E9)]);

        let many: Vec<u32> = (0x700..0x70C).collect();
        let shared = pass_filters(&many, false);
        assert_eq!(shared.len(), 1);
        let (mask, pattern) = shared[0];
        assert!(many.iter().all(|id| id & mask == pattern & mask));
    }

    #[tokio::test]
    async fn test_read_loop_skips_transient_and_stops_on_unplug() {
        let api = FakeApi::default();
        {
            let mut reads = api.reads.lock();
            reads.push_back(Ok(vec![rx(0x7E8, &[0x02, 0x50, 0x01])]));
            reads.push_back(PassThruStatus::Timeout.check("PassThruReadMsgs").map(|_| Vec::new()));
            reads.push_back(Ok(vec![rx(0x7E9, &[0x01])]));
            reads.push_back(PassThruStatus::DeviceNotConnected.check("PassThruReadMsgs").map(|_| Vec::new()));
        }
        let adapter = PassThruAdapter::new("PassThru", Config::default(), api);
        let mut frames = adapter.recv().unwrap();
        let mut errors = adapter.errors().unwrap();
        adapter.connect(&CancelToken::new()).await.unwrap();

        let first = frames.recv().await.unwrap();
        assert_eq!(first.id(), 0x7E8);
        assert_eq!(first.data(), &[0x02, 0x50, 0x01]);
        assert_eq!(frames.recv().await.unwrap().id(), 0x7E9);

        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, AdapterError::Fatal(_)));
        adapter.close().await.unwrap();
        assert!(*adapter.api.closed.lock());
    }

    #[tokio::test]
    async fn test_persistent_read_error_is_paced() {
        let api = FakeApi::default();
        *api.stuck.lock() = Some(PassThruStatus::InvalidMsg);
        let reported = Arc::new(AtomicUsize::new(0));
        let config = {
            let reported = reported.clone();
            Config::default().on_error(move |_| {
                reported.fetch_add(1, Ordering::SeqCst);
            })
        };
        let adapter = PassThruAdapter::new("PassThru", config, api);
        let mut errors = adapter.errors().unwrap();
        adapter.connect(&CancelToken::new()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, AdapterError::InvalidConfig(_)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        adapter.close().await.unwrap();

        let mut total = 1 + reported.load(Ordering::SeqCst);
        while errors.try_recv().is_ok() {
            total += 1;
        }
        assert!(total <= 6, "{} read errors reported in 250ms", total);
    }

    #[tokio::test]
    async fn test_writes_and_filter_updates() {
        let adapter = PassThruAdapter::new("PassThru", Config::default(), FakeApi::default());
        adapter.connect(&CancelToken::new()).await.unwrap();
        assert_eq!(adapter.api.filters.lock().len(), 1);

        adapter
            .sender()
            .send(Frame::outgoing(0x7E0, vec![0x02u8, 0x10, 0x03]))
            .await
            .unwrap();
        adapter.set_filter(&[0x7E8]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while adapter.api.written.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let written = adapter.api.written.lock()[0].clone();
        assert_eq!(written.data, vec![0x00, 0x00, 0x07, 0xE0, 0x02, 0x10, 0x03]);
        assert_eq!(adapter.api.filters.lock()[0].1.data, vec![0x00, 0x00, 0x07, 0xE8]);
        adapter.close().await.unwrap();
    }
}
