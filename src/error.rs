use std::io;

use thiserror::Error;

/// Errors surfaced by engine setup and launch.
///
/// Per-connection I/O failures are handled inside the engine (close and
/// recycle the affected connection) and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Engine setup failed (bad configuration, no listen address, ...).
    #[error("engine setup failed: {0}")]
    Setup(String),

    /// An outbound body would overflow the wire header's u16 length field.
    #[error("packet exceeds maximum encodable size")]
    PacketTooLarge,

    /// A required system resource limit could not be satisfied.
    #[error("resource limit: {0}")]
    ResourceLimit(String),
}
