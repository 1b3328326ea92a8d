//! HTTP/1.1 message parsing and serialization (spec §4.1, §4.2).

pub mod chunked;
pub mod headers;
pub mod message;

pub use headers::HeaderMap;
pub use message::{HttpMessage, MessageKind, State};
