//! adsbus-core: packet model, clock normalization and wire codecs for the
//! adsbus message bus.
//!
//! No I/O here, just algorithms. The `adsbus` crate owns sockets and
//! processes and drives these types from its reactor.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod packet;
pub mod retry;
pub mod server;
pub mod types;

// Re-export commonly used types at crate root
pub use buffer::RingBuffer;
pub use codec::{Decoder, Encoder, Format, Parsed};
pub use config::{BusConfig, EndpointSpec, FileMode, Role, Target};
pub use packet::{Packet, PacketKind};
pub use retry::RetryPolicy;
pub use server::ServerInfo;
pub use types::*;
