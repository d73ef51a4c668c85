//! canlink-core - frame model, adapter contract and registry
//!
//! Every transport in canlink, whether a USB-serial ASCII dongle, an AT-command
//! OBD interface, a binary bridge, a raw CAN socket or the local gateway,
//! is exposed to application code through the same [`Adapter`] contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Registry                              │
//! │   name → (AdapterInfo, constructor)   built once at startup  │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ new_adapter(name, Config)
//!                   ┌────────┴────────┐
//!                   │ Box<dyn Adapter>│
//!                   └────────┬────────┘
//!                            │ composed from
//!                   ┌────────┴────────┐
//!                   │  BaseAdapter    │  outbound / inbound / error channels
//!                   │  CancelToken    │  exactly-once shutdown
//!                   └─────────────────┘
//! ```

pub mod adapter;
pub mod base;
pub mod cancel;
pub mod config;
pub mod error;
pub mod frame;
pub mod info;
pub mod registry;
pub mod version;

pub use adapter::Adapter;
pub use base::{BaseAdapter, ChannelDepths, DEFAULT_CLOSE_GRACE};
pub use cancel::CancelToken;
pub use config::{is_accept_all, parse_filter, Config, ErrorCallback, MessageCallback};
pub use error::{AdapterError, AdapterResult};
pub use frame::{
    Frame, FrameKind, FrameType, MAX_DATA_LEN, MAX_EXTENDED_ID, MAX_STANDARD_ID, SYSTEM_MSG,
    SYSTEM_MSG_COMMAND, SYSTEM_MSG_DATA_REQUEST, SYSTEM_MSG_DATA_RESPONSE, SYSTEM_MSG_ERROR,
    SYSTEM_MSG_FILTER, SYSTEM_MSG_INFO, SYSTEM_MSG_WRITE_RESPONSE,
};
pub use info::{AdapterInfo, Capabilities, PortInfo};
pub use registry::{Constructor, Registry, RegistryBuilder, RegistryError};
pub use version::{check_firmware, compare_versions};
