//! canlink-gateway - share CAN adapters between processes
//!
//! A gateway listens on a per-user Unix socket. Each streaming session names
//! an adapter in its hello, gets its own instance from the registry and keeps
//! it for the lifetime of the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  HELLO / FRAME   ┌──────────────────────────────────────┐
//! │  client  │ ◄──────────────► │ GatewayServer                        │
//! └──────────┘                  │   Gateway::handle                    │
//!                               │     ├─ Session ─► Registry ─► Adapter│
//! ┌──────────┐  COMMAND / LIST  │     └─ unary replies                 │
//! │  client  │ ◄──────────────► │                                      │
//! └──────────┘                  └──────────────────────────────────────┘
//! ```

pub mod error;
pub mod guard;
pub mod metadata;
pub mod paths;
pub mod ports;
pub mod server;
pub mod session;
pub mod wire;

pub use error::{GatewayError, GatewayResult};
pub use metadata::{hello, session_config, ADAPTER_KEY};
pub use paths::default_socket_path;
pub use ports::{FixedPorts, PortLister, SerialPorts};
pub use server::{Gateway, GatewayServer, DEFAULT_DRAIN_GRACE};
pub use session::Session;
pub use wire::{read_message, write_message, Message, SENTINEL_ID};
