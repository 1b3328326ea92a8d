//! Error kinds shared across the connection engine.
//!
//! Mirrors spec §7 one-for-one: these are the *kinds* that matter to the
//! per-connection handler's propagation policy, not a catalogue of every
//! possible I/O failure. Per-connection errors never unwind a worker; the
//! handler catches them at its own boundary and tears the connection down.

use std::fmt;
use std::io;

/// An error kind produced while driving one connection.
///
/// Never causes a worker-process panic; the handler logs it and tears the
/// offending connection down, per spec §7's propagation policy.
#[derive(Debug)]
pub enum ProxyError {
    /// Request or response bytes violate the HTTP/1.1 grammar this parser
    /// understands. Carries the HTTP status the caller should emit, if any.
    ProtocolViolation { status: Option<u16>, detail: String },
    /// A plugin rejected the request outright (`handle_client_request`
    /// returned nothing after already queuing a response, or explicitly
    /// asked for a status+body).
    RequestRejected { status: Option<u16>, body: Option<Vec<u8>> },
    /// `CONNECT`/forward connect to the upstream host:port failed.
    UpstreamConnectFailed { host: String, port: u16, reason: String },
    /// `auth_code` is configured and the request's `Proxy-Authorization`
    /// didn't match.
    ProxyAuthFailed,
    /// A method was called on a handler/plugin before `initialize`, or
    /// after `teardown` — a programmer error, not a wire-level one.
    Uninitialized(&'static str),
    /// The peer closed its end in an orderly fashion (EOF). Not logged as
    /// an error; the handler tears the connection down silently.
    PeerClosed,
    /// `EPIPE` / `ECONNRESET` on flush, or any other broken-pipe class I/O
    /// error — also results in teardown.
    BrokenPipe(io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation { status, detail } => {
                write!(f, "protocol violation ({status:?}): {detail}")
            }
            Self::RequestRejected { status, .. } => {
                write!(f, "request rejected by plugin (status {status:?})")
            }
            Self::UpstreamConnectFailed { host, port, reason } => {
                write!(f, "connect to upstream {host}:{port} failed: {reason}")
            }
            Self::ProxyAuthFailed => write!(f, "proxy authentication failed"),
            Self::Uninitialized(what) => write!(f, "used before initialization: {what}"),
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::BrokenPipe(e) => write!(f, "broken pipe: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BrokenPipe(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => Self::PeerClosed,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Self::BrokenPipe(e),
            _ => Self::BrokenPipe(e),
        }
    }
}

/// The well-known, byte-exact response packets from spec §6.
pub mod well_known {
    /// `HTTP/1.1 200 Connection established\r\n\r\n`
    pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

    /// The `Proxy-agent` header value advertised on every synthetic
    /// response, matching the original's `PROXY_AGENT_HEADER_VALUE`.
    pub fn proxy_agent() -> String {
        format!("relayproxy v{}", env!("CARGO_PKG_VERSION"))
    }

    /// Builds the canonical 502 Bad Gateway packet.
    pub fn bad_gateway() -> Vec<u8> {
        build_simple(502, "Bad Gateway", "Bad Gateway", &[("Connection", "close")])
    }

    /// Builds the canonical 407 Proxy Authentication Required packet.
    pub fn proxy_auth_required() -> Vec<u8> {
        build_simple(
            407,
            "Proxy Authentication Required",
            "Proxy Authentication Required",
            &[("Proxy-Authenticate", "Basic"), ("Connection", "close")],
        )
    }

    /// Builds a bare 404/501-style page with `Server:` instead of
    /// `Proxy-agent:`, as spec §6 requires for the web server responses.
    pub fn server_error_page(status: u16, reason: &str) -> Vec<u8> {
        let mut pkt = format!("HTTP/1.1 {status} {reason}\r\n");
        pkt.push_str(&format!("Server: {}\r\n", proxy_agent()));
        pkt.push_str("Connection: close\r\n");
        pkt.push_str("Content-Length: 0\r\n\r\n");
        pkt.into_bytes()
    }

    fn build_simple(status: u16, reason: &str, body: &str, extra: &[(&str, &str)]) -> Vec<u8> {
        let mut pkt = format!("HTTP/1.1 {status} {reason}\r\n");
        pkt.push_str(&format!("Proxy-agent: {}\r\n", proxy_agent()));
        for (k, v) in extra {
            pkt.push_str(&format!("{k}: {v}\r\n"));
        }
        pkt.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        pkt.push_str(body);
        pkt.into_bytes()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tunnel_established_is_byte_exact() {
            assert_eq!(TUNNEL_ESTABLISHED, b"HTTP/1.1 200 Connection established\r\n\r\n");
        }

        #[test]
        fn bad_gateway_has_expected_shape() {
            let pkt = bad_gateway();
            let text = String::from_utf8(pkt).unwrap();
            assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
            assert!(text.contains("Connection: close\r\n"));
            assert!(text.ends_with("Bad Gateway"));
        }

        #[test]
        fn proxy_auth_required_has_expected_shape() {
            let pkt = proxy_auth_required();
            let text = String::from_utf8(pkt).unwrap();
            assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
            assert!(text.contains("Proxy-Authenticate: Basic\r\n"));
        }
    }
}
