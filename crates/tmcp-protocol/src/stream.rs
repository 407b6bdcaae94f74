//! Incremental JSONL stream parser.
//!
//! [`StreamParser`] buffers incoming bytes and yields complete [`Request`]
//! frames as full lines become available. This is how the stdio reader
//! copes with data arriving in arbitrary chunks: lines may be split across
//! reads, and several lines may land in one read.

use crate::{JsonlCodec, ProtocolError, Request};

/// Default maximum line length (16 MiB).
const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Incremental JSONL request parser.
///
/// Accepts arbitrary byte chunks via [`push`](Self::push) and returns fully
/// parsed frames once a complete newline-terminated line is available.
/// Handles partial lines, blank lines, and multi-line chunks.
#[derive(Debug, Clone)]
pub struct StreamParser {
    buf: Vec<u8>,
    max_line_len: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser with the default line bound.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    /// Create a parser with a custom line bound.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_len,
        }
    }

    /// Feed a chunk of bytes, returning one result per complete line.
    ///
    /// Blank lines are silently skipped. Incomplete trailing data is kept in
    /// the internal buffer until the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Request, ProtocolError>> {
        self.buf.extend_from_slice(data);
        self.drain_lines()
    }

    /// Flush any remaining data, treating it as a final unterminated line.
    pub fn finish(&mut self) -> Vec<Result<Request, ProtocolError>> {
        if !self.buf.is_empty() && !self.buf.ends_with(b"\n") {
            self.buf.push(b'\n');
        }
        self.drain_lines()
    }

    /// Whether the internal buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn drain_lines(&mut self) -> Vec<Result<Request, ProtocolError>> {
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            out.push(JsonlCodec::decode(trimmed));
        }
        if self.buf.len() > self.max_line_len {
            self.buf.clear();
            out.push(Err(ProtocolError::Violation(format!(
                "line exceeds {} bytes",
                self.max_line_len
            ))));
        }
        out
    }
}
