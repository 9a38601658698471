// src/decoder.rs
//
// Frame decoder seam. The decode loop hands each dequeued chunk to a
// FrameDecoder, which accumulates partial frames and returns one Packet per
// completed frame. Each returned packet becomes one DataReceived event.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::DecodeError;

/// Get current time in microseconds since UNIX epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// One logically complete message reconstructed from the byte stream.
#[derive(Clone, Debug, Serialize)]
pub struct Packet {
    pub bytes: Vec<u8>,
    /// Host UNIX timestamp in microseconds.
    pub timestamp_us: u64,
    /// Set when the packet was produced by a flush and may be truncated
    /// (e.g. no closing delimiter was seen before the stream ended).
    pub incomplete: bool,
}

impl Packet {
    /// Create a complete packet stamped with the current time.
    pub fn new(bytes: Vec<u8>) -> Self {
        Packet {
            bytes,
            timestamp_us: now_us(),
            incomplete: false,
        }
    }

}

/// Reassembles packets from the chunks pulled off the byte queue.
///
/// `feed` is invoked once per dequeued chunk, in strict arrival order, from
/// the decode loop's thread. Implementations keep whatever partial-frame
/// state they need between calls.
pub trait FrameDecoder: Send {
    /// Consume one chunk; return any packets completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Packet>, DecodeError>;

    /// Emit any buffered partial frame. Called when the stream ends.
    fn flush(&mut self) -> Option<Packet> {
        None
    }
}

/// Pass-through decoder: every chunk becomes exactly one packet.
#[derive(Debug, Default)]
pub struct RawDecoder;

impl FrameDecoder for RawDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Packet>, DecodeError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Packet::new(chunk.to_vec())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_decoder_one_packet_per_chunk() {
        let mut decoder = RawDecoder;
        let packets = decoder.feed(&[1, 2, 3]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].bytes, vec![1, 2, 3]);
        assert!(!packets[0].incomplete);
    }

    #[test]
    fn test_raw_decoder_skips_empty_chunks() {
        let mut decoder = RawDecoder;
        assert!(decoder.feed(&[]).unwrap().is_empty());
        assert!(decoder.flush().is_none());
    }
}
