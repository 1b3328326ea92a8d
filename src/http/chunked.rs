//! Chunked transfer-coding sub-parser (spec §4.2).
//!
//! A re-enterable generalization of the teacher's one-shot
//! `decode_chunked_body` helper (`webserver::proxy::decode_chunked_body` in
//! the original repo): that version assumed the whole body had already
//! arrived; this one is fed byte-by-byte across socket reads and tracks its
//! own state so it can be paused mid-chunk and resumed on the next `feed`.

/// State of the chunked body sub-parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkedState {
    WaitingForSize,
    WaitingForData,
    Complete,
}

/// Incremental chunked-encoding decoder.
#[derive(Clone, Debug)]
pub struct ChunkedParser {
    pub state: ChunkedState,
    // chunk data length + the trailing CRLF (next_size + 2), or 0 while
    // waiting on a size line.
    target_len: usize,
    next_size: usize,
    partial: Vec<u8>,
    pub body: Vec<u8>,
    leftover: Vec<u8>,
}

impl Default for ChunkedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedParser {
    pub fn new() -> Self {
        Self {
            state: ChunkedState::WaitingForSize,
            target_len: 0,
            next_size: 0,
            partial: Vec::new(),
            body: Vec::new(),
            leftover: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkedState::Complete
    }

    /// Feeds more raw bytes. Returns the number of trailing bytes that were
    /// *not* consumed (only non-zero once `state` reaches `Complete`, since
    /// bytes after the terminating chunk belong to whatever follows).
    ///
    /// Accumulates chunk-data-plus-separator as one span (`next_size + 2`
    /// bytes) before splitting it, so a `CRLF` split exactly across two
    /// `feed` calls is handled the same as any other split.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.leftover.extend_from_slice(data);
        loop {
            match self.state {
                ChunkedState::Complete => return self.leftover.len(),
                ChunkedState::WaitingForSize => {
                    let Some(pos) = find_crlf(&self.leftover) else {
                        return 0;
                    };
                    let line = String::from_utf8_lossy(&self.leftover[..pos]).into_owned();
                    self.leftover.drain(..pos + 2);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let Ok(size) = usize::from_str_radix(size_str, 16) else {
                        // Malformed size line: nothing more we can do.
                        self.state = ChunkedState::Complete;
                        return self.leftover.len();
                    };
                    if size == 0 {
                        self.state = ChunkedState::Complete;
                        if self.leftover.starts_with(b"\r\n") {
                            self.leftover.drain(..2);
                        }
                        return self.leftover.len();
                    }
                    self.next_size = size;
                    self.target_len = size + 2;
                    self.state = ChunkedState::WaitingForData;
                }
                ChunkedState::WaitingForData => {
                    let need = self.target_len - self.partial.len();
                    let take = need.min(self.leftover.len());
                    self.partial.extend(self.leftover.drain(..take));
                    if self.partial.len() < self.target_len {
                        return 0;
                    }
                    self.partial.truncate(self.next_size);
                    self.body.append(&mut self.partial);
                    self.state = ChunkedState::WaitingForSize;
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Frames `buf` as a chunked body with `k`-byte chunks: hex-size CRLF,
/// k-byte slice CRLF, ..., terminating `0` CRLF CRLF.
pub fn to_chunks(buf: &[u8], k: usize) -> Vec<u8> {
    assert!(k >= 1, "chunk size must be at least 1");
    let mut out = Vec::with_capacity(buf.len() + buf.len() / k.max(1) * 8 + 16);
    for chunk in buf.chunks(k) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_body_fed_at_once() {
        let mut p = ChunkedParser::new();
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        p.feed(input);
        assert!(p.is_complete());
        assert_eq!(p.body, b"hello world");
    }

    #[test]
    fn parses_body_fed_byte_by_byte() {
        let mut p = ChunkedParser::new();
        let input = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        for byte in input {
            p.feed(&[*byte]);
        }
        assert!(p.is_complete());
        assert_eq!(p.body, b"hello world");
    }

    #[test]
    fn round_trips_through_to_chunks() {
        let original = b"the quick brown fox jumps over the lazy dog".to_vec();
        for k in [1usize, 3, 7, 64] {
            let framed = to_chunks(&original, k);
            let mut p = ChunkedParser::new();
            p.feed(&framed);
            assert!(p.is_complete(), "k={k}");
            assert_eq!(p.body, original, "k={k}");
        }
    }

    #[test]
    fn reports_unconsumed_trailing_bytes_after_completion() {
        let mut p = ChunkedParser::new();
        let trailing = p.feed(b"0\r\n\r\nGET / HTTP/1.1\r\n");
        assert!(p.is_complete());
        assert_eq!(trailing, "GET / HTTP/1.1\r\n".len());
    }
}
