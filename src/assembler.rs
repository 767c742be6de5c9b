//! Reassembles IEC101 frames from a serial byte stream.
//!
//! Bytes are pushed in as they arrive from the port and frames are pulled
//! out one at a time. Bytes that can't start a valid frame are dropped one by
//! one, so the stream resynchronizes on the next good start byte.
//!
//! ## Example
//! ```
//! use iec101_bridge::{FrameAssembler, Frame};
//! let mut assembler = FrameAssembler::new();
//! assembler.push(b"\x00\x10\x40\x01");
//! assert!(assembler.next_frame().is_err()); // garbage byte
//! assert_eq!(assembler.next_frame(), Ok(None)); // waiting for the rest
//! assembler.push(b"\x00\x41\x16");
//! assert!(matches!(assembler.next_frame(), Ok(Some(Frame::Fixed(_)))));
//! ```

use log::trace;
use snafu::Snafu;

use crate::buffer::Buffer;
use crate::frame::Frame;
use crate::nom_parser::{parse_frame, FrameToken};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    /// A byte was dropped while searching for the next frame.
    #[snafu(display("Discarded byte {:#04x} while resynchronizing", byte))]
    Discarded { byte: u8 },
}

#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Buffer,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Buffer::new(),
        }
    }

    /// Append bytes received from the port.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    /// Take the next complete frame.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Call repeatedly until
    /// it does, since one read may carry several frames.
    /// # Errors
    /// [`Error::Discarded`] when the first buffered byte was dropped. This is
    /// not fatal, the caller just keeps going.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let (consumed, token) = parse_frame(self.buffer.as_ref());
        self.buffer.consume(consumed);
        match token {
            FrameToken::Frame(frame) => {
                trace!("Assembled frame of {} bytes", consumed);
                Ok(Some(frame))
            }
            FrameToken::NeedData => Ok(None),
            FrameToken::Discard(byte) => DiscardedSnafu { byte }.fail(),
        }
    }

    /// Number of buffered bytes not yet part of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered, used when the port is reopened.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
