//! Incremental line/token extraction over a caller-supplied byte buffer, and a
//! growable, always-NUL-terminated string buffer used to build request bytes.
//!
//! Both types mirror the line-oriented scanning a load generator needs for
//! textual configuration/headers input: a single pass over a buffer that may
//! span multiple reads, with terminators overwritten in place so that
//! `next_line`/`next_token` hand back zero-terminated views rather than
//! allocating. HTTP response parsing does not use this module; see
//! `http::response` for that.

/// A line/token scanner over an in-place byte buffer.
///
/// In `http` mode, `next_line` stops at the first `CRLF` and keeps `\r\n`
/// together as a single terminator; otherwise it treats any run of `\r`/`\n`
/// bytes as one terminator. Either way the terminator bytes are overwritten
/// with `0` so the returned line and any tokens within it are NUL-terminated.
#[derive(Debug)]
pub struct LineParser {
    buf: Vec<u8>,
    len: usize,
    http_mode: bool,
    line_start: usize,
    line_end: usize,
    tok_start: usize,
    tok_end: usize,
    line_complete: bool,
}

impl LineParser {
    /// Creates a parser over a fresh buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            len: 0,
            http_mode: false,
            line_start: 0,
            line_end: 0,
            tok_start: 0,
            tok_end: 0,
            line_complete: false,
        }
    }

    /// Switches newline handling between HTTP (`CRLF`-together) and general
    /// (any run of `\r`/`\n`) mode.
    pub fn set_http_mode(&mut self, on: bool) {
        self.http_mode = on;
    }

    /// The buffer region available for a read, as `(ptr_offset, remaining_len)`.
    pub fn read_info(&self) -> (usize, usize) {
        (self.len, self.buf.len() - self.len)
    }

    /// Mutable access to the unfilled tail of the buffer, for reading into.
    pub fn read_buf(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Records that `n` freshly-read bytes were placed at the end of the
    /// filled region.
    pub fn set_read_length(&mut self, n: usize) {
        self.len += n;
    }

    /// Advances to the next line. Returns `true` if a complete line is now
    /// available via [`LineParser::line`].
    pub fn next_line(&mut self) -> bool {
        if self.line_end > 0 {
            self.line_start = self.line_end;
        }
        if self.line_end >= self.len {
            self.line_complete = false;
            return false;
        }

        while self.line_end < self.len && !is_newline(self.buf[self.line_end]) {
            self.line_end += 1;
        }
        if self.line_end >= self.len {
            self.line_complete = false;
            return false;
        }

        if self.http_mode {
            if self.buf[self.line_end] == b'\r' {
                self.null_last();
                if self.line_end < self.len && self.buf[self.line_end] == b'\n' {
                    self.null_last();
                }
            } else {
                self.null_last();
            }
        } else {
            while self.line_end < self.len && is_newline(self.buf[self.line_end]) {
                self.null_last();
            }
        }

        self.tok_start = self.line_start;
        self.tok_end = self.line_start;
        self.line_complete = true;
        true
    }

    fn null_last(&mut self) {
        self.buf[self.line_end] = 0;
        self.line_end += 1;
    }

    /// The current line, if complete, as bytes up to (not including) its NUL.
    pub fn line(&self) -> Option<&[u8]> {
        if !self.line_complete {
            return None;
        }
        let end = self.buf[self.line_start..self.line_end]
            .iter()
            .position(|&b| b == 0)
            .map(|p| self.line_start + p)
            .unwrap_or(self.line_end);
        Some(&self.buf[self.line_start..end])
    }

    /// Splits the current line on any byte in `separators`, returning
    /// successive tokens. Returns `None` once the line is exhausted.
    pub fn next_token(&mut self, separators: &[u8]) -> Option<&[u8]> {
        if !self.line_complete || self.tok_end >= self.line_end {
            return None;
        }

        self.tok_start = self.tok_end;
        while self.tok_end < self.line_end && !separators.contains(&self.buf[self.tok_end]) {
            self.tok_end += 1;
        }
        let tok_stop = self.tok_end;
        while self.tok_end < self.line_end && separators.contains(&self.buf[self.tok_end]) {
            self.buf[self.tok_end] = 0;
            self.tok_end += 1;
        }

        Some(&self.buf[self.tok_start..tok_stop])
    }

    /// Compacts unconsumed bytes to the front of the buffer. Returns `true` if
    /// the buffer is now full (an overflow signal to the caller).
    pub fn reset(&mut self) -> bool {
        let remaining = if !self.line_complete {
            let remaining = self.len - self.line_start;
            self.buf.copy_within(self.line_start..self.len, 0);
            remaining
        } else {
            0
        };
        self.len = remaining;
        self.line_start = 0;
        self.line_end = 0;
        self.line_complete = false;
        remaining >= self.buf.len()
    }
}

fn is_newline(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

const DEFAULT_STRINGBUF_SIZE: usize = 256;

/// A growable byte buffer with `printf`-style append, doubling growth, and an
/// implicit NUL terminator maintained just past the logical length.
#[derive(Debug, Default)]
pub struct StringBuf {
    buf: Vec<u8>,
}

impl StringBuf {
    /// Creates an empty buffer, pre-allocating at least `size_hint` bytes.
    pub fn new(size_hint: usize) -> Self {
        let cap = if size_hint > 0 {
            size_hint
        } else {
            DEFAULT_STRINGBUF_SIZE
        };
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Appends `s` to the buffer.
    pub fn append(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Appends raw bytes to the buffer.
    pub fn append_bytes(&mut self, s: &[u8]) {
        self.buf.extend_from_slice(s);
    }

    /// Appends formatted arguments, as `write!` would.
    pub fn append_fmt(&mut self, args: std::fmt::Arguments<'_>) {
        use std::io::Write;
        let _ = self.buf.write_fmt(args);
    }

    /// The buffer contents so far.
    pub fn get(&self) -> &[u8] {
        &self.buf
    }

    /// The number of bytes appended so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Empties the buffer without releasing its allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_line_finds_crlf_in_http_mode() {
        let mut lp = LineParser::new(64);
        lp.set_http_mode(true);
        let data = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        lp.read_buf()[..data.len()].copy_from_slice(data);
        lp.set_read_length(data.len());

        assert!(lp.next_line());
        assert_eq!(lp.line(), Some(&b"GET / HTTP/1.1"[..]));
        assert!(lp.next_line());
        assert_eq!(lp.line(), Some(&b"Host: x"[..]));
        assert!(lp.next_line());
        assert_eq!(lp.line(), Some(&b""[..]));
    }

    #[test]
    fn next_line_returns_false_on_incomplete_buffer() {
        let mut lp = LineParser::new(64);
        lp.set_http_mode(true);
        let data = b"GET / HTTP/1.1";
        lp.read_buf()[..data.len()].copy_from_slice(data);
        lp.set_read_length(data.len());

        assert!(!lp.next_line());
    }

    #[test]
    fn next_token_splits_on_separators() {
        let mut lp = LineParser::new(64);
        lp.set_http_mode(true);
        let data = b"GET /foo HTTP/1.1\r\n";
        lp.read_buf()[..data.len()].copy_from_slice(data);
        lp.set_read_length(data.len());
        lp.next_line();

        assert_eq!(lp.next_token(b" "), Some(&b"GET"[..]));
        assert_eq!(lp.next_token(b" "), Some(&b"/foo"[..]));
        assert_eq!(lp.next_token(b" "), Some(&b"HTTP/1.1"[..]));
        assert_eq!(lp.next_token(b" "), None);
    }

    #[test]
    fn reset_compacts_unconsumed_tail() {
        let mut lp = LineParser::new(16);
        lp.set_http_mode(true);
        let data = b"GET / HTTP";
        lp.read_buf()[..data.len()].copy_from_slice(data);
        lp.set_read_length(data.len());

        assert!(!lp.next_line());
        let full = lp.reset();
        assert!(!full);
        assert_eq!(lp.read_info(), (data.len(), 16 - data.len()));
    }

    #[test]
    fn string_buf_appends_and_grows() {
        let mut sb = StringBuf::new(0);
        sb.append("GET ");
        sb.append("/ HTTP/1.1\r\n");
        sb.append_fmt(format_args!("Content-Length: {}\r\n", 42));
        assert_eq!(
            sb.get(),
            b"GET / HTTP/1.1\r\nContent-Length: 42\r\n" as &[u8]
        );
    }
}
