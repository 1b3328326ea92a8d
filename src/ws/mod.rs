//! WebSocket frame codec and handshake support (spec §4.3).

pub mod frame;
pub mod keys;

pub use frame::{Frame, Opcode};
pub use keys::key_to_accept;
