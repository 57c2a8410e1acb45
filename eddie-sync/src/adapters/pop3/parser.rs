//! POP3 response framing.
//!
//! Incoming bytes are split into CRLF-terminated lines as they arrive. A
//! response is then extracted on demand, because POP3 gives no reliable way to
//! tell a single-line reply from a multiline one without knowing the command:
//!
//! - a negative status (`-ERR`) is always a single line
//! - a positive multiline reply runs until a line that is exactly `.\r\n`,
//!   which is excluded from the result, and data lines lose one leading
//!   stuffed `.`
//!
//! # Example
//!
//! ```ignore
//! let mut parser = Pop3Parser::new();
//! parser.push(b"+OK 2 messages\r\n1 120\r\n");
//! assert!(parser.extract_response(true).is_none()); // terminator not seen yet
//! parser.push(b".\r\n");
//! let response = parser.extract_response(true).unwrap();
//! assert_eq!(response.data_lines(), vec!["1 120"]);
//! ```

use std::collections::VecDeque;
use std::fmt;

/// Per RFC 1939, including the CRLF. Servers exceed it, so it is only logged.
const MAX_LINE_LENGTH: usize = 512;

const TERMINATOR: &[u8] = b".\r\n";

/// Accumulates raw bytes and hands out complete responses.
#[derive(Debug, Default)]
pub struct Pop3Parser {
    /// Bytes not yet terminated by CRLF.
    buffer: Vec<u8>,
    /// Complete lines (CRLF included) not yet claimed by a response.
    unprocessed_lines: VecDeque<Vec<u8>>,
}

impl Pop3Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add newly received bytes, splitting out every complete line.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let mut start = 0;
        let mut i = 0;
        while i + 1 < self.buffer.len() {
            if self.buffer[i] == b'\r' && self.buffer[i + 1] == b'\n' {
                let end = i + 2;
                if end - start > MAX_LINE_LENGTH {
                    tracing::trace!("POP3 line exceeds {} bytes", MAX_LINE_LENGTH);
                }
                self.unprocessed_lines
                    .push_back(self.buffer[start..end].to_vec());
                start = end;
                i = end;
            } else {
                i += 1;
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
    }

    /// Try to take one response off the front of the buffered lines.
    ///
    /// `multiline` is the caller's expectation; it is ignored when the status
    /// line is negative. Returns `None` until enough data has arrived.
    pub fn extract_response(&mut self, multiline: bool) -> Option<Response> {
        let first = self.unprocessed_lines.front()?;

        // Negative responses are never multiline.
        let multiline = multiline && first.first() == Some(&b'+');

        if !multiline {
            let line = self.unprocessed_lines.pop_front()?;
            return Some(Response::new(vec![line], false));
        }

        let end_index = self
            .unprocessed_lines
            .iter()
            .skip(1)
            .position(|line| line.as_slice() == TERMINATOR)
            .map(|pos| pos + 1)?;

        let mut lines: Vec<Vec<u8>> = self.unprocessed_lines.drain(..=end_index).collect();
        lines.pop();

        // The status line cannot be stuffed.
        for line in lines.iter_mut().skip(1) {
            if line.first() == Some(&b'.') {
                line.remove(0);
            }
        }

        Some(Response::new(lines, true))
    }

    /// Number of complete lines waiting to be claimed.
    pub fn buffered_lines(&self) -> usize {
        self.unprocessed_lines.len()
    }
}

/// A POP3 reply, positive or negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw lines including CRLF; the first is the status line.
    pub lines: Vec<Vec<u8>>,
    pub is_multiline: bool,
    pub ok: bool,
    /// Printable form of the request this response answered.
    pub request: Option<String>,
}

impl Response {
    pub fn new(lines: Vec<Vec<u8>>, is_multiline: bool) -> Self {
        let ok = lines
            .first()
            .map(|line| line.first() == Some(&b'+'))
            .unwrap_or(false);
        Self {
            lines,
            is_multiline,
            ok,
            request: None,
        }
    }

    /// A synthesized single-line `-ERR` reply.
    pub fn error(description: &str) -> Self {
        Self::new(vec![format!("-ERR {}\r\n", description).into_bytes()], false)
    }

    pub fn is_err(&self) -> bool {
        !self.ok
    }

    /// Status line text without the `+OK `/`-ERR ` prefix and CRLF.
    pub fn status_line(&self) -> String {
        let line = self.line_as_string(0);
        let line = line.trim_end_matches("\r\n");
        line.strip_prefix("+OK ")
            .or_else(|| line.strip_prefix("-ERR "))
            .unwrap_or(line)
            .to_string()
    }

    /// Line at `index`, CRLF included.
    pub fn line_as_string(&self, index: usize) -> String {
        self.lines
            .get(index)
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .unwrap_or_default()
    }

    pub fn lines_as_string(&self) -> Vec<String> {
        (0..self.lines.len())
            .map(|i| self.line_as_string(i))
            .collect()
    }

    /// Lines after the status line, CRLF stripped.
    pub fn data_lines(&self) -> Vec<String> {
        (1..self.lines.len())
            .map(|i| {
                let line = self.line_as_string(i);
                line.strip_suffix("\r\n").unwrap_or(&line).to_string()
            })
            .collect()
    }

    /// Data portion of a multiline reply with CRLFs intact.
    pub fn data_as_string(&self) -> String {
        let bytes: Vec<u8> = self.lines.iter().skip(1).flatten().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.lines_as_string();
        let joined: Vec<&str> = lines.iter().map(|l| l.trim_end_matches("\r\n")).collect();
        write!(f, "{}", joined.join("\r\n"))
    }
}
