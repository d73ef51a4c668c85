//! canlink-adapters - transports and drivers
//!
//! Serial drivers are a [`StreamAdapter`](stream::StreamAdapter) built from a
//! [`TransportOpener`] and a [`Protocol`](stream::Protocol): the protocol runs
//! the handshake and hands back a decoder and an encoder, the stream adapter
//! runs the two pumps around them.
//!
//! | driver        | codec  | transport  |
//! |---------------|--------|------------|
//! | `CANUSB`      | ASCII  | serial     |
//! | `SLCAN`       | ASCII  | serial     |
//! | `ELM327`      | AT     | serial     |
//! | `OBDLink SX`  | AT     | serial     |
//! | `CANBridge`   | binary | serial     |
//! | `SocketCAN`   | -      | raw socket |
//! | `Loopback`    | -      | in-memory  |

pub mod driver;
pub mod j2534;
pub mod stream;
pub mod transport;

pub use driver::{default_registry, register_all, register_with};
pub use stream::{Decoded, Protocol, Session, StreamAdapter, StreamDecoder, StreamEncoder};
pub use transport::{available_ports, SerialOpener, Transport, TransportOpener};
