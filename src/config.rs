// src/config.rs
//
// Serial port configuration and conversions to the serialport crate's types.
// The configuration is fixed once a port is opened; only the poll interval
// may change at runtime (see `SerialPort::set_poll_interval`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits};

/// Default delay between receive-loop read attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default scratch read buffer capacity, in bytes.
pub const DEFAULT_READ_BUFFER_CAPACITY: usize = 256;

/// Default transport read timeout. Bounds how long a single blocking read
/// holds the receive loop before the closing flag is re-checked.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Parity setting for serial port configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line configuration. Immutable after the port is opened.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    /// Port name, e.g. "COM3" or "/dev/ttyUSB0".
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Capacity of the receive loop's scratch buffer.
    pub read_buffer_capacity: usize,
    /// Transport read timeout.
    pub read_timeout: Duration,
}

impl SerialConfig {
    /// Create a configuration for the given port with 8-N-1 line settings.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        SerialConfig {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to the serialport crate's Parity type.
pub fn to_serialport_parity(p: &Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert a data bit count to the serialport crate's DataBits type.
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert a stop bit count to the serialport crate's StopBits type.
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}
