//! Socket and transport primitives (spec §3, §4.7, §4.8).

pub mod buffered;
pub mod fd;

pub use buffered::{BufferedConnection, Tag, Transport};
