//! Per-process identity announced in protocol headers.

use uuid::Uuid;

/// Version string sent in JSON and structured headers.
pub const SERVER_VERSION: &str = concat!("adsbus/", env!("CARGO_PKG_VERSION"));

/// Identity of this bus instance. Created once at startup and passed by
/// reference to everything that writes or checks a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: Uuid,
    pub version: &'static str,
}

impl ServerInfo {
    /// Fresh random identity.
    pub fn generate() -> Self {
        ServerInfo {
            id: Uuid::new_v4(),
            version: SERVER_VERSION,
        }
    }
}
