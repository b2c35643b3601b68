//! Line-oriented buffering for server-sent-event streams.
//!
//! Upstream SSE frames normally fit in a few hundred bytes, but some
//! providers emit very large frames (base64 tool payloads, giant JSON
//! deltas). The buffer starts small and grows on demand up to a hard cap;
//! a frame that exceeds the cap poisons the buffer and the caller is
//! expected to stop feeding it.

use crate::error::UpstreamError;

/// Initial buffer capacity. Matches the common case of small SSE frames.
pub const INITIAL_CAPACITY: usize = 8 * 1024;

/// Hard upper bound for a single frame. Anything larger is treated as a
/// telemetry parse failure rather than a reason to buffer without bound.
pub const MAX_FRAME_BYTES: usize = 15 * 1024 * 1024;

/// Splits an incoming byte stream into complete lines.
///
/// Carriage returns preceding the newline are stripped. Incomplete input is
/// retained across `push` calls; [`LineBuffer::take_tail`] drains whatever
/// unterminated text remains at end of stream.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    poisoned: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            poisoned: false,
        }
    }

    /// Append raw bytes and return every line completed by them.
    ///
    /// Fails once a single line grows past [`MAX_FRAME_BYTES`]; after that
    /// every further call fails as well.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, UpstreamError> {
        if self.poisoned {
            return Err(self.overflow_error());
        }

        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let mut line = &self.buf[start..start + offset];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if line.len() > MAX_FRAME_BYTES {
                self.poisoned = true;
                return Err(self.overflow_error());
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start += offset + 1;
        }
        self.buf.drain(..start);

        // An unterminated residue past the cap can never become a valid
        // frame, so fail early instead of buffering the rest of the stream.
        if self.buf.len() > MAX_FRAME_BYTES {
            self.poisoned = true;
            return Err(self.overflow_error());
        }

        Ok(lines)
    }

    /// Drain the trailing unterminated line, if any.
    pub fn take_tail(&mut self) -> Option<String> {
        if self.poisoned || self.buf.is_empty() {
            return None;
        }
        let mut line: &[u8] = &self.buf;
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let tail = String::from_utf8_lossy(line).into_owned();
        self.buf.clear();
        Some(tail)
    }

    fn overflow_error(&self) -> UpstreamError {
        UpstreamError::TelemetryParse {
            message: format!("SSE frame exceeds {MAX_FRAME_BYTES} bytes"),
        }
    }
}
