//! Byte-stuffed, checksummed framing used by the PIC bootloader.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+---------------------------+----------+-----+
//! | STX |  payload (byte-stuffed)   | checksum | ETX |
//! +-----+---------------------------+----------+-----+
//! | 0F  |  any bytes, markers are   | stuffed  | 04  |
//! |     |  prefixed with DLE (05)   | too      |     |
//! +-----+---------------------------+----------+-----+
//! ```
//!
//! The checksum is chosen so that the sum of every payload byte plus the
//! checksum is zero modulo 256.

use log::trace;

/// Start of frame marker.
pub const STX: u8 = 0x0F;

/// End of frame marker.
pub const ETX: u8 = 0x04;

/// Escape marker: the following byte is taken literally.
pub const DLE: u8 = 0x05;

/// Largest payload the decoder accepts (checksum byte included).
pub const MAX_RESPONSE_LEN: usize = 80;

/// Whether `byte` has to be escaped inside a frame.
pub fn is_marker(byte: u8) -> bool {
    matches!(byte, STX | ETX | DLE)
}

/// Two's-complement checksum of `payload`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
        .wrapping_neg()
}

/// Encode `payload` into a complete frame ready for the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * (payload.len() + 1) + 2);
    out.push(STX);
    for &byte in payload.iter().chain(std::iter::once(&checksum(payload))) {
        if is_marker(byte) {
            out.push(DLE);
        }
        out.push(byte);
    }
    out.push(ETX);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    InFrame,
    Escaped,
}

/// Incremental frame decoder.
///
/// Bytes are pushed one at a time; a payload is returned only once a whole
/// frame with a valid checksum has arrived. Frames with a bad checksum or
/// that overflow the size limit are dropped silently.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buf: Vec<u8>,
    sum: u8,
    limit: usize,
    overflow: bool,
    rejected: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an idle decoder accepting up to [`MAX_RESPONSE_LEN`] bytes per frame.
    pub fn new() -> Self {
        Self::with_limit(MAX_RESPONSE_LEN)
    }

    /// Create an idle decoder accepting up to `limit` bytes per frame,
    /// checksum included.
    pub fn with_limit(limit: usize) -> Self {
        assert!(limit > 0, "frame limit must be positive");
        Self {
            state: DecodeState::Idle,
            buf: Vec::with_capacity(limit),
            sum: 0,
            limit,
            overflow: false,
            rejected: 0,
        }
    }

    /// Drop any partial frame and wait for the next start marker.
    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.buf.clear();
        self.sum = 0;
        self.overflow = false;
    }

    /// Number of frames dropped because of a bad checksum or overflow.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Feed one received byte. Returns the payload of a completed, valid frame.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match (self.state, byte) {
            (DecodeState::Escaped, _) => {
                self.append(byte);
                None
            },
            (_, STX) => {
                self.reset();
                self.state = DecodeState::InFrame;
                None
            },
            (DecodeState::Idle, _) => None,
            (DecodeState::InFrame, DLE) => {
                self.state = DecodeState::Escaped;
                None
            },
            (DecodeState::InFrame, ETX) => self.finish(),
            (DecodeState::InFrame, _) => {
                self.append(byte);
                None
            },
        }
    }

    fn append(&mut self, byte: u8) {
        if self.buf.len() < self.limit {
            self.buf.push(byte);
        } else {
            self.overflow = true;
        }
        self.sum = self.sum.wrapping_add(byte);
        self.state = DecodeState::InFrame;
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        let valid = self.sum == 0 && !self.overflow;
        let mut payload = std::mem::take(&mut self.buf);
        self.reset();

        if !valid {
            self.rejected += 1;
            trace!("Dropping corrupt frame ({} bytes)", payload.len());
            return None;
        }

        // Strip the checksum byte.
        payload.pop();
        trace!("Received frame: {payload:02X?}");
        Some(payload)
    }
}
