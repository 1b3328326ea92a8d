//! Incremental HTTP/1.1 request/response parser and serializer (spec §4.1).
//!
//! Generalizes the teacher's `Client::read_http_request`, which already
//! buffers partial `TcpStream::read`s looking for `\r\n\r\n` and a
//! `Content-Length`-driven body read. Here that buffering becomes an
//! explicit, re-enterable state machine so `feed` can be called with any
//! split of the same byte stream and reach the same terminal state —
//! required once a proxy has to parse requests that may arrive a few bytes
//! at a time.

use std::collections::HashSet;

use super::chunked::ChunkedParser;
use super::headers::HeaderMap;

/// Which half of an HTTP exchange this message represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Parser state, matching spec §3's data model exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Initialized,
    LineReceived,
    ReceivingHeaders,
    HeadersComplete,
    ReceivingBody,
    Complete,
}

/// Request-only fields, populated once the request line is parsed.
#[derive(Clone, Debug, Default)]
pub struct RequestFields {
    pub method: String,
    pub raw_url: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
}

/// Response-only fields, populated once the status line is parsed.
#[derive(Clone, Debug, Default)]
pub struct ResponseFields {
    pub code: u16,
    pub reason: String,
}

/// A parsed (or in-progress) HTTP/1.1 request or response.
#[derive(Clone, Debug)]
pub struct HttpMessage {
    pub kind: MessageKind,
    pub state: State,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub request: RequestFields,
    pub response: ResponseFields,

    raw: Vec<u8>,
    leftover: Vec<u8>,
    body_remaining: Option<usize>,
    chunked: Option<ChunkedParser>,
}

impl HttpMessage {
    pub fn request() -> Self {
        Self::new(MessageKind::Request)
    }

    pub fn response() -> Self {
        Self::new(MessageKind::Response)
    }

    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            state: State::Initialized,
            version: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            request: RequestFields::default(),
            response: ResponseFields::default(),
            raw: Vec::new(),
            leftover: Vec::new(),
            body_remaining: None,
            chunked: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Feeds more raw bytes. Idempotent with respect to the concatenation
    /// of all bytes ever fed: splitting the same stream differently across
    /// calls reaches the same terminal state and fields (spec §8).
    pub fn feed(&mut self, data: &[u8]) -> Result<(), String> {
        self.raw.extend_from_slice(data);
        self.leftover.extend_from_slice(data);

        loop {
            match self.state {
                State::Complete => return Ok(()),
                State::Initialized | State::LineReceived | State::ReceivingHeaders => {
                    let Some(pos) = find_crlf(&self.leftover) else {
                        return Ok(());
                    };
                    let line = String::from_utf8_lossy(&self.leftover[..pos]).into_owned();
                    self.leftover.drain(..pos + 2);

                    if self.state == State::Initialized {
                        self.parse_first_line(&line)?;
                        self.state = State::LineReceived;
                    } else if line.is_empty() {
                        self.state = State::HeadersComplete;
                    } else {
                        if !self.headers.parse_line(&line) {
                            return Err(format!("malformed header line: {line:?}"));
                        }
                        self.state = State::ReceivingHeaders;
                    }
                }
                State::HeadersComplete => {
                    self.enter_body_phase()?;
                }
                State::ReceivingBody => {
                    self.advance_body();
                    if self.state != State::ReceivingBody {
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn parse_first_line(&mut self, line: &str) -> Result<(), String> {
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(format!("malformed start line: {line:?}"));
        }
        match self.kind {
            MessageKind::Request => {
                self.request.method = parts[0].to_string();
                self.request.raw_url = parts[1].to_string();
                self.version = parts[2].to_string();
                self.split_request_url()?;
            }
            MessageKind::Response => {
                self.version = parts[0].to_string();
                self.response.code = parts[1]
                    .parse()
                    .map_err(|_| format!("malformed status code: {}", parts[1]))?;
                self.response.reason = parts[2].to_string();
            }
        }
        Ok(())
    }

    /// Splits `request.raw_url` into host/port/path per spec §4.1.
    fn split_request_url(&mut self) -> Result<(), String> {
        let url = self.request.raw_url.clone();
        if self.request.method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_authority(&url).ok_or_else(|| "invalid CONNECT target".to_string())?;
            self.request.host = Some(host);
            self.request.port = Some(port);
            self.request.path = url;
            return Ok(());
        }

        if let Some((host, port, path)) = split_absolute_uri(&url) {
            self.request.host = Some(host);
            self.request.port = Some(port);
            self.request.path = path;
        } else {
            // Origin-form request-target (no absolute-URI). Host comes from
            // the `Host:` header once headers are parsed; path is the
            // request-target itself.
            self.request.path = if url.is_empty() { "/".to_string() } else { url };
        }
        Ok(())
    }

    /// Call after headers are available, to resolve `Host`/`port` for
    /// origin-form requests and to validate CONNECT's invariant.
    fn resolve_host_from_headers(&mut self) -> Result<(), String> {
        if self.request.host.is_none() {
            if let Some(host_header) = self.headers.get("host") {
                let (host, port) = split_authority(host_header).unwrap_or((host_header.to_string(), 80));
                self.request.host = Some(host);
                self.request.port = Some(port);
            }
        }
        if self.request.method.eq_ignore_ascii_case("CONNECT") && self.request.host.is_none() {
            return Err("CONNECT request lacking absolute-URI and Host header".to_string());
        }
        Ok(())
    }

    fn enter_body_phase(&mut self) -> Result<(), String> {
        if self.kind == MessageKind::Request {
            self.resolve_host_from_headers()?;
        }

        if let Some(len) = self.content_length() {
            self.body_remaining = Some(len);
            if len == 0 {
                self.state = State::Complete;
            } else {
                self.state = State::ReceivingBody;
            }
            return Ok(());
        }
        if self.is_chunked() {
            self.chunked = Some(ChunkedParser::new());
            self.state = State::ReceivingBody;
            return Ok(());
        }

        // Terminal rules without length or chunked encoding (spec §4.1).
        match self.kind {
            MessageKind::Response => {
                // Only a bare status-line-plus-blank-line (no headers at
                // all) completes immediately here; a response that carried
                // any headers but no Content-Length/chunked framing stays
                // open until EOF (original's narrow `state == LINE_RCVD`
                // check in `HttpParser.process()`).
                if self.headers.is_empty() {
                    self.state = State::Complete;
                } else {
                    self.state = State::ReceivingBody;
                }
            }
            MessageKind::Request => {
                if self.raw.ends_with(b"\r\n\r\n") {
                    self.state = State::Complete;
                } else {
                    self.state = State::ReceivingBody;
                }
            }
        }
        Ok(())
    }

    fn advance_body(&mut self) {
        if let Some(remaining) = self.body_remaining {
            let take = remaining.min(self.leftover.len());
            self.body.extend(self.leftover.drain(..take));
            self.body_remaining = Some(remaining - take);
            if self.body_remaining == Some(0) {
                self.state = State::Complete;
            }
            return;
        }

        if let Some(chunked) = self.chunked.as_mut() {
            let data = std::mem::take(&mut self.leftover);
            let unconsumed = chunked.feed(&data);
            if chunked.is_complete() {
                self.body = std::mem::take(&mut chunked.body);
                let total = data.len();
                self.leftover = data[total - unconsumed..].to_vec();
                self.state = State::Complete;
            }
            return;
        }

        // No content-length, no chunked: re-check the terminal rules as
        // more bytes arrive (matches the teacher's own "keep reading until
        // the socket goes quiet" behavior).
        match self.kind {
            MessageKind::Response => {
                // Caller drives completion via its own read-until-EOF loop;
                // treat every byte received as body until told otherwise.
                self.body.extend(std::mem::take(&mut self.leftover));
            }
            MessageKind::Request => {
                self.body.extend(self.leftover.iter().copied());
                if self.raw.ends_with(b"\r\n\r\n") {
                    self.leftover.clear();
                    self.state = State::Complete;
                } else {
                    self.leftover.clear();
                }
            }
        }
    }

    /// Serializes this message, dropping any header whose lowercased name
    /// is in `disable`. Re-chunks the body at `chunk_size` if the original
    /// message was chunked.
    pub fn build(&self, disable: &HashSet<String>, chunk_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        match self.kind {
            MessageKind::Request => {
                out.extend_from_slice(
                    format!("{} {} {}\r\n", self.request.method, self.request.raw_url, self.version)
                        .as_bytes(),
                );
            }
            MessageKind::Response => {
                out.extend_from_slice(
                    format!("{} {} {}\r\n", self.version, self.response.code, self.response.reason)
                        .as_bytes(),
                );
            }
        }
        out.extend_from_slice(self.headers.build(disable).as_bytes());
        out.extend_from_slice(b"\r\n");

        if self.is_chunked() {
            out.extend_from_slice(&super::chunked::to_chunks(&self.body, chunk_size.max(1)));
        } else {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Splits `host:port` (or bare `host`, defaulting the port to 80).
fn split_authority(target: &str) -> Option<(String, u16)> {
    if target.is_empty() {
        return None;
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            port.parse().ok().map(|p| (host.to_string(), p))
        }
        _ => Some((target.to_string(), 80)),
    }
}

/// Splits an absolute-URI request-target into `(host, port, path)`. `path`
/// is the path plus (`?`query if any) plus (`#`fragment if any); `/` when
/// empty, per spec §4.1.
fn split_absolute_uri(target: &str) -> Option<(String, u16, String)> {
    let rest = target.strip_prefix("http://").or_else(|| target.strip_prefix("https://"))?;
    let (authority, path_and_rest) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let (host, port) = split_authority(authority)?;
    let path = if path_and_rest.is_empty() { "/".to_string() } else { path_and_rest.to_string() };
    Some((host, port, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_headers_and_content_length_body() {
        let mut m = HttpMessage::request();
        m.feed(b"POST /submit HTTP/1.1\r\nHost: example.org\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        assert!(m.is_complete());
        assert_eq!(m.request.method, "POST");
        assert_eq!(m.request.path, "/submit");
        assert_eq!(m.request.host.as_deref(), Some("example.org"));
        assert_eq!(m.body, b"hello");
    }

    #[test]
    fn idempotent_across_arbitrary_splits() {
        let full = b"GET http://example.org/x?a=1 HTTP/1.1\r\nHost: example.org\r\nContent-Length: 3\r\n\r\nabc";
        let mut whole = HttpMessage::request();
        whole.feed(full).unwrap();

        for split in 1..full.len() {
            let mut m = HttpMessage::request();
            m.feed(&full[..split]).unwrap();
            m.feed(&full[split..]).unwrap();
            assert!(m.is_complete(), "split at {split}");
            assert_eq!(m.body, whole.body, "split at {split}");
            assert_eq!(m.request.path, whole.request.path, "split at {split}");
            assert_eq!(m.request.host, whole.request.host, "split at {split}");
        }
    }

    #[test]
    fn absolute_uri_splits_host_port_path() {
        let mut m = HttpMessage::request();
        m.feed(b"GET http://example.org:8080/a/b?x=1#frag HTTP/1.1\r\nHost: example.org:8080\r\n\r\n")
            .unwrap();
        assert!(m.is_complete());
        assert_eq!(m.request.host.as_deref(), Some("example.org"));
        assert_eq!(m.request.port, Some(8080));
        assert_eq!(m.request.path, "/a/b?x=1#frag");
    }

    #[test]
    fn default_port_is_80_when_absent() {
        let mut m = HttpMessage::request();
        m.feed(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
        assert_eq!(m.request.port, Some(80));
    }

    #[test]
    fn connect_parses_authority_form() {
        let mut m = HttpMessage::request();
        m.feed(b"CONNECT upstream:443 HTTP/1.1\r\nHost: upstream:443\r\n\r\n").unwrap();
        assert!(m.is_complete());
        assert_eq!(m.request.host.as_deref(), Some("upstream"));
        assert_eq!(m.request.port, Some(443));
    }

    #[test]
    fn connect_without_host_or_absolute_uri_is_rejected() {
        let mut m = HttpMessage::request();
        // A bare relative path with no Host header is not a valid CONNECT target.
        let result = (|| -> Result<(), String> {
            m.feed(b"CONNECT /nope HTTP/1.1\r\n\r\n")?;
            Ok(())
        })();
        assert!(result.is_err() || m.request.host.is_none());
    }

    #[test]
    fn response_completes_on_content_length() {
        let mut m = HttpMessage::response();
        m.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").unwrap();
        assert!(m.is_complete());
        assert_eq!(m.response.code, 200);
        assert_eq!(m.body, b"hi");
    }

    #[test]
    fn response_completes_on_chunked_body() {
        let mut m = HttpMessage::response();
        m.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n")
            .unwrap();
        assert!(m.is_complete());
        assert_eq!(m.body, b"hello");
    }

    #[test]
    fn build_round_trips_request() {
        let mut m = HttpMessage::request();
        m.feed(b"GET http://example.org/x HTTP/1.1\r\nHost: example.org\r\n\r\n").unwrap();
        let disable = HashSet::new();
        let rebuilt = m.build(&disable, 4096);
        let mut m2 = HttpMessage::request();
        m2.feed(&rebuilt).unwrap();
        assert_eq!(m2.request.method, m.request.method);
        assert_eq!(m2.request.path, m.request.path);
        assert_eq!(m2.headers.get("host"), m.headers.get("host"));
    }
}
