// src/framer.rs
//
// Built-in framing implementations: delimiter-based, SLIP (RFC 1055) and
// raw pass-through. `SerialFramer` sits behind the `FrameDecoder` seam so a
// port can be opened with any of these directly.

use serde::{Deserialize, Serialize};

use crate::decoder::{now_us, FrameDecoder, Packet};
use crate::error::DecodeError;

// =============================================================================
// SLIP Constants (RFC 1055)
// =============================================================================

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

/// Framing encoding types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingEncoding {
    /// Delimiter-based framing.
    Delimiter {
        /// Delimiter byte sequence (e.g. [0x0D, 0x0A] for CRLF).
        delimiter: Vec<u8>,
        /// Max frame length before forced split.
        max_length: usize,
        /// Whether to include the delimiter in output frames.
        include_delimiter: bool,
    },
    /// SLIP framing (RFC 1055).
    Slip,
    /// No framing; every chunk passes through as one frame.
    Raw,
}

impl Default for FramingEncoding {
    fn default() -> Self {
        FramingEncoding::Slip
    }
}

/// A frame boundary found in the stream, before timestamping.
struct Frame {
    bytes: Vec<u8>,
    incomplete: bool,
}

impl Frame {
    fn complete(bytes: Vec<u8>) -> Self {
        Frame {
            bytes,
            incomplete: false,
        }
    }

    fn into_packet(self) -> Packet {
        Packet {
            bytes: self.bytes,
            timestamp_us: now_us(),
            incomplete: self.incomplete,
        }
    }
}

trait Framing: Send {
    fn feed(&mut self, data: &[u8]) -> Vec<Frame>;
    fn flush(&mut self) -> Option<Frame>;
}

// =============================================================================
// Delimiter-Based Framer
// =============================================================================

struct DelimiterFramer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    max_length: usize,
    include_delimiter: bool,
}

impl Framing for DelimiterFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        for &byte in data {
            self.buffer.push(byte);

            // Check for a delimiter match at the end of the buffer.
            if self.buffer.len() >= self.delimiter.len() {
                let start = self.buffer.len() - self.delimiter.len();
                if self.buffer[start..] == self.delimiter[..] {
                    let frame: Vec<u8> = if self.include_delimiter {
                        self.buffer.drain(..).collect()
                    } else {
                        let frame = self.buffer.drain(..start).collect();
                        self.buffer.clear();
                        frame
                    };
                    if !frame.is_empty() {
                        frames.push(Frame::complete(frame));
                    }
                }
            }

            // Force a split at max length.
            if self.buffer.len() >= self.max_length {
                frames.push(Frame::complete(self.buffer.drain(..).collect()));
            }
        }

        frames
    }

    fn flush(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame {
            bytes: self.buffer.drain(..).collect(),
            incomplete: true,
        })
    }
}

// =============================================================================
// SLIP Framer (RFC 1055)
// =============================================================================

struct SlipFramer {
    buffer: Vec<u8>,
    in_escape: bool,
}

impl Framing for SlipFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        for &byte in data {
            match byte {
                SLIP_END => {
                    if !self.buffer.is_empty() {
                        frames.push(Frame::complete(self.buffer.drain(..).collect()));
                    }
                    self.in_escape = false;
                }
                SLIP_ESC => {
                    self.in_escape = true;
                }
                SLIP_ESC_END if self.in_escape => {
                    self.buffer.push(SLIP_END);
                    self.in_escape = false;
                }
                SLIP_ESC_ESC if self.in_escape => {
                    self.buffer.push(SLIP_ESC);
                    self.in_escape = false;
                }
                _ => {
                    if self.in_escape {
                        // Protocol error - keep both bytes.
                        self.buffer.push(SLIP_ESC);
                        self.in_escape = false;
                    }
                    self.buffer.push(byte);
                }
            }
        }

        frames
    }

    fn flush(&mut self) -> Option<Frame> {
        self.in_escape = false;
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame {
            bytes: self.buffer.drain(..).collect(),
            incomplete: true,
        })
    }
}

// =============================================================================
// Raw Framer (pass-through)
// =============================================================================

struct RawFramer;

impl Framing for RawFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        if data.is_empty() {
            return Vec::new();
        }
        vec![Frame::complete(data.to_vec())]
    }

    fn flush(&mut self) -> Option<Frame> {
        None
    }
}

// =============================================================================
// Public SerialFramer
// =============================================================================

/// Stateful framer for streaming serial data.
///
/// Implements [`FrameDecoder`], so it can be handed to
/// `SerialPort::with_decoder` directly.
pub struct SerialFramer {
    framing: Box<dyn Framing>,
}

impl SerialFramer {
    pub fn new(encoding: FramingEncoding) -> Self {
        let framing: Box<dyn Framing> = match encoding {
            FramingEncoding::Delimiter {
                delimiter,
                max_length,
                include_delimiter,
            } => Box::new(DelimiterFramer {
                buffer: Vec::new(),
                delimiter,
                max_length,
                include_delimiter,
            }),
            FramingEncoding::Slip => Box::new(SlipFramer {
                buffer: Vec::new(),
                in_escape: false,
            }),
            FramingEncoding::Raw => Box::new(RawFramer),
        };

        SerialFramer { framing }
    }
}

impl FrameDecoder for SerialFramer {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Packet>, DecodeError> {
        Ok(self
            .framing
            .feed(chunk)
            .into_iter()
            .map(Frame::into_packet)
            .collect())
    }

    /// Emit any buffered partial frame, marked incomplete.
    fn flush(&mut self) -> Option<Packet> {
        self.framing.flush().map(Frame::into_packet)
    }
}

/// SLIP encode data for transmission.
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + 2);
    encoded.push(SLIP_END); // Leading END flushes any line noise

    for &byte in data {
        match byte {
            SLIP_END => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_ESC);
            }
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);
    encoded
}
