//! Line framing for captured process output.
//!
//! Engines print arbitrary bytes: progress bars with carriage returns,
//! locale-dependent text, the occasional binary dump. [`OutputLineCodec`]
//! never fails on content. Invalid UTF-8 is replaced lossily, a trailing
//! `\r` is stripped, and a line longer than [`MAX_LINE_BYTES`] is emitted in
//! pieces rather than buffered without bound.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use pimd_orchestrator::orchestrator::codec::OutputLineCodec;
//!
//! let lines = FramedRead::new(child_stdout, OutputLineCodec::new());
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::AppError;

/// Longest line emitted in one piece: 64 KiB.
pub const MAX_LINE_BYTES: usize = 65_536;

/// Lossy, bounded newline decoder.
#[derive(Debug, Clone)]
pub struct OutputLineCodec {
    max_length: usize,
    /// Bytes of `src` already scanned without finding `\n`.
    next_index: usize,
}

impl OutputLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom piece length (minimum 1).
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }

    fn take_line(src: &mut BytesMut, len: usize, skip: usize) -> String {
        let raw = src.split_to(len);
        src.advance(skip);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, AppError> {
        let scan_end = src.len().min(self.max_length + 1);
        let start = self.next_index.min(scan_end);
        let newline = src[start..scan_end]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| offset + start);

        match newline {
            Some(pos) => {
                self.next_index = 0;
                Ok(Some(Self::take_line(src, pos, 1)))
            }
            None if src.len() > self.max_length => {
                self.next_index = 0;
                Ok(Some(Self::take_line(src, self.max_length, 0)))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, AppError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            let len = src.len();
            Ok(Some(Self::take_line(src, len, 0)))
        }
    }
}
