// src/error.rs
//
// Error taxonomy for the serial port core. Only `open`, `write` and port
// enumeration fail synchronously; every failure inside the background loops
// is reported through the `Exception` event channel instead.

use std::io;

use thiserror::Error;

/// Failure reported by a frame decoder for one chunk. The chunk is consumed,
/// not retried.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

#[derive(Debug, Error)]
pub enum SerialError {
    /// `open()` was called while the port was not closed. State is unchanged.
    #[error("port {0} is already open")]
    AlreadyOpen(String),

    /// The underlying line could not be opened. State reverts to closed.
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    /// A non-timeout read failure. Dispatched as an `Exception` event; the
    /// receive loop continues.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// A decoder rejected a chunk. Dispatched as an `Exception` event; the
    /// decode loop continues.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// A transmit request could not be queued or serviced.
    #[error("write failed: {0}")]
    Write(String),

    /// A write was attempted while the port was not listening.
    #[error("port is not open")]
    NotOpen,

    /// Serial port enumeration failed.
    #[error("failed to enumerate ports: {0}")]
    Enumerate(String),
}
