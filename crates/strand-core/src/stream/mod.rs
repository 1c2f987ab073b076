//! Byte streams carried inside call arguments and results.

pub mod mux;
pub mod payload;
pub mod readable;
pub mod writable;

pub use mux::StreamMux;
pub use payload::Payload;
pub use readable::ReadableStream;
pub use writable::{ChunkSink, WritableStream};
