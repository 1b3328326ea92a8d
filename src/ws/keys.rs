//! RFC 6455 handshake accept-key derivation.

use base64::Engine;
use sha1::{Digest, Sha1};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Returns `base64(SHA1(key ++ GUID))`, the value of `Sec-WebSocket-Accept`
/// for a handshake whose `Sec-WebSocket-Key` was `key`.
pub fn key_to_accept(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(GUID);
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            key_to_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
