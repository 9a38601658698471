// src/lib.rs
//
// linetap - threaded serial port listener with framing and typed event
// dispatch.

//! A serial port communication core built on two cooperative background
//! threads per open session: a receive loop that pulls byte chunks off the
//! transport into a strict-FIFO queue, and a decode loop that drains the
//! queue through a pluggable [`FrameDecoder`]. Decoded packets, failures and
//! lifecycle changes are surfaced as typed [`SerialEvent`]s, queued by the
//! loops and delivered to registered listeners when the embedding
//! application calls [`SerialPort::update`] on its own thread.
//!
//! ```no_run
//! use linetap::{EventKind, SerialConfig, SerialEvent, SerialPort};
//!
//! let config = SerialConfig::new("/dev/ttyUSB0", 115200);
//! let mut port = SerialPort::new(config);
//!
//! port.add_listener(EventKind::DataReceived, |event| {
//!     if let SerialEvent::DataReceived { packet, .. } = event {
//!         println!("packet: {} bytes", packet.bytes.len());
//!     }
//! });
//!
//! port.open()?;
//! while port.is_open() {
//!     port.update(); // deliver queued events on this thread
//! }
//! # Ok::<(), linetap::SerialError>(())
//! ```

pub mod config;
pub mod decoder;
pub mod error;
pub mod event;
pub mod framer;
pub mod port;
pub mod transport;

pub use config::{Parity, SerialConfig};
pub use decoder::{now_us, FrameDecoder, Packet, RawDecoder};
pub use error::{DecodeError, SerialError};
pub use event::{EventDispatcher, EventKind, ListenerId, SerialEvent};
pub use framer::{slip_encode, FramingEncoding, SerialFramer};
pub use port::{PortState, SerialPort};
pub use transport::{available_ports, PortInfo, SerialTransport, Transport};
