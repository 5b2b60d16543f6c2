//! Splitting an inbound byte stream into protocol lines.

use bytes::BytesMut;
use thiserror::Error;

/// Default upper bound on the length of a single line, in bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 1 << 20;

/// Accumulates inbound bytes and yields complete lines.
///
/// Lines are terminated by `\n`. A trailing `\r` is stripped as well, since some servers and
/// proxies emit CRLF line endings.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    // number of leading bytes of buf known to contain no newline. avoids rescanning a long
    // partial line every time a few more bytes arrive.
    scanned: usize,
    max_line_len: usize,
}

impl LineBuffer {
    /// Construct empty with [`DEFAULT_MAX_LINE_LEN`].
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Construct empty with a custom line length limit.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        LineBuffer {
            buf: BytesMut::new(),
            scanned: 0,
            max_line_len,
        }
    }

    /// Number of buffered bytes not yet returned as lines.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append newly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Take the next complete line, if one is buffered.
    ///
    /// Errors if the line is not valid UTF-8 or exceeds the length limit. A partial line that
    /// already exceeds the limit errors before its terminator arrives.
    pub fn next_line(&mut self) -> Result<Option<String>, LineError> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            if self.buf.len() > self.max_line_len {
                return Err(LineError::TooLong { limit: self.max_line_len });
            }
            return Ok(None);
        };
        let end = self.scanned + offset;
        self.scanned = 0;

        let mut line = self.buf.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        if line.len() > self.max_line_len {
            return Err(LineError::TooLong { limit: self.max_line_len });
        }
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| LineError::InvalidUtf8)
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Error for an inbound line the framing layer cannot accept.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LineError {
    #[error("line exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}
