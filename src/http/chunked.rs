//! Chunked transfer-encoding body framing, split out of [`super::ResponseParser`]
//! since its own little state machine (size line, chunk data, trailing CRLF,
//! zero-size terminator) is easiest to reason about in isolation.

use super::HttpParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
    Done,
}

#[derive(Debug, Clone)]
pub(super) struct ChunkedBody {
    state: ChunkState,
    partial: Vec<u8>,
}

impl ChunkedBody {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            partial: Vec::new(),
        }
    }

    /// Feeds more body bytes. Returns `(consumed, done)`.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, bool), HttpParseError> {
        let mut consumed = 0;

        while consumed < data.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::Size => {
                    let Some(nl) = data[consumed..].iter().position(|&b| b == b'\n') else {
                        self.partial.extend_from_slice(&data[consumed..]);
                        consumed = data.len();
                        break;
                    };
                    let line_end = consumed + nl;
                    let line_start = consumed;
                    consumed = line_end + 1;

                    let owned;
                    let line: &[u8] = if self.partial.is_empty() {
                        &data[line_start..line_end]
                    } else {
                        self.partial.extend_from_slice(&data[line_start..line_end]);
                        owned = std::mem::take(&mut self.partial);
                        &owned
                    };
                    let line = trim_cr(line);
                    // Ignore chunk extensions after `;`.
                    let size_str = line.split(|&b| b == b';').next().unwrap_or(line);
                    let size = std::str::from_utf8(size_str)
                        .ok()
                        .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                        .ok_or(HttpParseError::ChunkFraming)?;

                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = (data.len() - consumed).min(remaining);
                    consumed += take;
                    let left = remaining - take;
                    self.state = if left == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataCrlf => {
                    // Expect and discard the CRLF following chunk data.
                    let Some(nl) = data[consumed..].iter().position(|&b| b == b'\n') else {
                        consumed = data.len();
                        break;
                    };
                    consumed += nl + 1;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(nl) = data[consumed..].iter().position(|&b| b == b'\n') else {
                        self.partial.extend_from_slice(&data[consumed..]);
                        consumed = data.len();
                        break;
                    };
                    let line_end = consumed + nl;
                    let trailer_empty = trim_cr(&data[consumed..line_end]).is_empty() && self.partial.is_empty();
                    consumed = line_end + 1;
                    self.partial.clear();
                    if trailer_empty {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => break,
            }
        }

        Ok((consumed, self.state == ChunkState::Done))
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_chunks_then_terminator() {
        let mut c = ChunkedBody::new();
        let data = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (n, done) = c.feed(data).unwrap();
        assert_eq!(n, data.len());
        assert!(done);
    }

    #[test]
    fn handles_chunk_split_across_feeds() {
        let mut c = ChunkedBody::new();
        let (n1, done1) = c.feed(b"4\r\nWi").unwrap();
        assert_eq!(n1, 5);
        assert!(!done1);
        let (n2, done2) = c.feed(b"ki\r\n0\r\n\r\n").unwrap();
        assert_eq!(n2, 9);
        assert!(done2);
    }

    #[test]
    fn rejects_non_hex_chunk_size() {
        let mut c = ChunkedBody::new();
        let err = c.feed(b"zz\r\n").unwrap_err();
        assert_eq!(err, HttpParseError::ChunkFraming);
    }
}
