//! SLIP framing (RFC 1055) for serial transports.
//!
//! Requests arrive as SLIP frames terminated by `END`; responses go back the
//! same way. See: https://datatracker.ietf.org/doc/html/rfc1055

use super::config::{MAX_SLIP_FRAME_SIZE, SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use super::error::{DfuError, DfuResult};

/// Frame `data` for the wire: escape special bytes and terminate with `END`.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() * 2 + 1);

    for &byte in data {
        match byte {
            SLIP_END => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);
    encoded
}

/// Streaming SLIP decoder.
///
/// Bytes are fed as they come off the link. Empty frames (back-to-back
/// `END`s) are skipped, and a frame that grows past `max_frame` is dropped.
#[derive(Debug)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escape_next: bool,
    /// Discarding bytes until the next `END` after an error.
    discarding: bool,
    max_frame: usize,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_SLIP_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            escape_next: false,
            discarding: false,
            max_frame,
        }
    }

    /// Feed one byte.
    ///
    /// Returns `Some(Ok(frame))` when a frame completes, `Some(Err(_))` when
    /// the current frame is malformed, `None` otherwise.
    pub fn feed(&mut self, byte: u8) -> Option<DfuResult<Vec<u8>>> {
        if byte == SLIP_END {
            let discarding = self.discarding;
            let escape_pending = self.escape_next;
            let frame = std::mem::take(&mut self.buffer);
            self.reset();

            if discarding || frame.is_empty() {
                return None;
            }
            if escape_pending {
                return Some(Err(DfuError::IncompleteSlipFrame));
            }
            return Some(Ok(frame));
        }

        if self.discarding {
            return None;
        }

        let decoded = if self.escape_next {
            self.escape_next = false;
            match byte {
                SLIP_ESC_END => SLIP_END,
                SLIP_ESC_ESC => SLIP_ESC,
                _ => return Some(Err(self.abort(DfuError::InvalidSlipEscape))),
            }
        } else if byte == SLIP_ESC {
            self.escape_next = true;
            return None;
        } else {
            byte
        };

        if self.buffer.len() >= self.max_frame {
            let size = self.buffer.len() + 1;
            return Some(Err(self.abort(DfuError::SlipBufferOverflow {
                size,
                max_size: self.max_frame,
            })));
        }
        self.buffer.push(decoded);
        None
    }

    /// Feed a chunk and collect every frame it completes. Malformed frames
    /// are returned as errors in arrival order.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<DfuResult<Vec<u8>>> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    /// Drop the partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.escape_next = false;
        self.discarding = false;
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    fn abort(&mut self, error: DfuError) -> DfuError {
        self.buffer.clear();
        self.escape_next = false;
        self.discarding = true;
        error
    }
}
