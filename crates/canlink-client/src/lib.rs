//! canlink-client - reach adapters shared by a canlink gateway
//!
//! # Example
//!
//! ```rust,no_run
//! use canlink_client::{GatewayClient, RemoteAdapter};
//! use canlink_core::{Adapter, CancelToken, Config, Frame};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let path = canlink_gateway::default_socket_path();
//!     GatewayClient::new(&path).ping().await?;
//!
//!     let adapter = RemoteAdapter::new(&path, "ELM327", Config::new("/dev/ttyUSB0"));
//!     let mut rx = adapter.recv().ok_or_else(|| anyhow::anyhow!("receiver taken"))?;
//!     adapter.connect(&CancelToken::new()).await?;
//!     adapter.sender().send(Frame::outgoing(0x7E0, vec![0x02u8, 0x3E, 0x00])).await?;
//!     let _reply = rx.recv().await;
//!     adapter.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod remote;

pub use client::GatewayClient;
pub use error::{ClientError, ClientResult};
pub use remote::{register, RemoteAdapter, GATEWAY, HANDSHAKE_TIMEOUT};
