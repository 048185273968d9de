//! A minimal, incremental, byte-fed HTTP/1.1 response parser.
//!
//! Every connection holds a live parser instance that is fed bytes as they
//! arrive and reports message-complete and the status code: a status line,
//! headers (just enough to determine the status code and body framing), and
//! a body delimited by `Content-Length`, chunked transfer-encoding, or — for
//! responses with neither — treated as already complete once headers end,
//! which matches every response this engine's own request construction can
//! provoke (it never sends `Transfer-Encoding` itself and always reads
//! whatever framing the server chooses to use). Response-body *content* is
//! never interpreted beyond what framing requires; validation past the
//! status code is out of scope.

use std::fmt;

mod chunked;

use chunked::ChunkedBody;

/// Observer invoked as the parser makes progress. Only the two callbacks the
/// engine actually needs are modeled.
pub trait ResponseObserver {
    /// Called once the status line has been fully parsed.
    fn on_status(&mut self, code: u16);
    /// Called once the full response (headers + body) has been consumed.
    fn on_message_complete(&mut self);
}

/// A parser-level protocol violation: a malformed status line, header, or
/// chunk framing. Always classified by the connection state machine as a
/// transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpParseError {
    /// The status line was not `HTTP/1.x SP 3DIGIT ...CRLF`.
    StatusLine,
    /// A header line was missing its `:` separator.
    HeaderLine,
    /// `Content-Length` was present but not a valid non-negative integer.
    ContentLength,
    /// Chunk-size line or trailer was malformed.
    ChunkFraming,
}

impl fmt::Display for HttpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpParseError::StatusLine => "invalid HTTP status line",
            HttpParseError::HeaderLine => "invalid HTTP header line",
            HttpParseError::ContentLength => "invalid Content-Length",
            HttpParseError::ChunkFraming => "invalid chunked transfer framing",
        })
    }
}

impl std::error::Error for HttpParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    ContentLength(usize),
    Chunked,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Body,
    Complete,
}

/// Incremental response parser. One instance lives per connection and is
/// reset (via [`ResponseParser::reset`]) between keep-alive requests.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    partial: Vec<u8>,
    body_mode: BodyMode,
    remaining: usize,
    chunked: ChunkedBody,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Creates a fresh parser, ready to consume a status line.
    pub fn new() -> Self {
        Self {
            state: State::StatusLine,
            partial: Vec::new(),
            body_mode: BodyMode::Empty,
            remaining: 0,
            chunked: ChunkedBody::new(),
        }
    }

    /// Resets the parser for the next request on a reused connection.
    pub fn reset(&mut self) {
        self.state = State::StatusLine;
        self.partial.clear();
        self.body_mode = BodyMode::Empty;
        self.remaining = 0;
        self.chunked = ChunkedBody::new();
    }

    /// Whether the parser has delivered `on_message_complete` for the
    /// request currently in flight.
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Feeds newly-read bytes to the parser, invoking `observer` as status
    /// line, headers, and body boundaries are crossed. Returns the number of
    /// bytes consumed from `data`; any unconsumed tail belongs to the next
    /// message or the next `feed` call and must not be discarded by the
    /// caller.
    pub fn feed(
        &mut self,
        data: &[u8],
        observer: &mut impl ResponseObserver,
    ) -> Result<usize, HttpParseError> {
        let mut consumed = 0;

        while consumed < data.len() && self.state != State::Complete {
            match self.state {
                State::StatusLine | State::Headers => {
                    let Some(nl) = data[consumed..].iter().position(|&b| b == b'\n') else {
                        self.partial.extend_from_slice(&data[consumed..]);
                        consumed = data.len();
                        break;
                    };
                    let line_end = consumed + nl;
                    let line_start = consumed;
                    consumed = line_end + 1;

                    let owned;
                    let line_bytes: &[u8] = if self.partial.is_empty() {
                        &data[line_start..line_end]
                    } else {
                        self.partial.extend_from_slice(&data[line_start..line_end]);
                        owned = std::mem::take(&mut self.partial);
                        &owned
                    };
                    let trimmed = trim_cr(line_bytes);

                    if self.state == State::StatusLine {
                        let code = parse_status_line(trimmed)?;
                        observer.on_status(code);
                        self.state = State::Headers;
                    } else if trimmed.is_empty() {
                        self.enter_body();
                        if self.state == State::Complete {
                            observer.on_message_complete();
                        }
                    } else {
                        self.apply_header(trimmed)?;
                    }
                }
                State::Body => {
                    let (n, done) = self.feed_body(&data[consumed..])?;
                    consumed += n;
                    if done {
                        self.state = State::Complete;
                        observer.on_message_complete();
                    }
                }
                State::Complete => break,
            }
        }

        Ok(consumed)
    }

    fn enter_body(&mut self) {
        match self.body_mode {
            BodyMode::ContentLength(0) | BodyMode::Empty => {
                self.state = State::Complete;
            }
            BodyMode::ContentLength(n) => {
                self.remaining = n;
                self.state = State::Body;
            }
            BodyMode::Chunked => {
                self.state = State::Body;
            }
        }
    }

    fn feed_body(&mut self, data: &[u8]) -> Result<(usize, bool), HttpParseError> {
        match self.body_mode {
            BodyMode::ContentLength(_) => {
                let take = data.len().min(self.remaining);
                self.remaining -= take;
                Ok((take, self.remaining == 0))
            }
            BodyMode::Chunked => self.chunked.feed(data),
            BodyMode::Empty => Ok((0, true)),
        }
    }

    fn apply_header(&mut self, line: &[u8]) -> Result<(), HttpParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(HttpParseError::HeaderLine)?;
        let name = &line[..colon];
        let value = trim_ows(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"content-length") {
            let n: usize = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or(HttpParseError::ContentLength)?;
            if !matches!(self.body_mode, BodyMode::Chunked) {
                self.body_mode = BodyMode::ContentLength(n);
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding")
            && value.to_ascii_lowercase().windows(7).any(|w| w == b"chunked")
        {
            self.body_mode = BodyMode::Chunked;
        }
        Ok(())
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|p| p + 1)
        .unwrap_or(start);
    &value[start..end]
}

fn parse_status_line(line: &[u8]) -> Result<u16, HttpParseError> {
    if !line.starts_with(b"HTTP/1.") {
        return Err(HttpParseError::StatusLine);
    }
    let mut parts = line.splitn(3, |&b| b == b' ');
    parts.next().ok_or(HttpParseError::StatusLine)?;
    let code = parts.next().ok_or(HttpParseError::StatusLine)?;
    let code = std::str::from_utf8(code)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|&c| (100..1000).contains(&c))
        .ok_or(HttpParseError::StatusLine)?;
    Ok(code)
}
