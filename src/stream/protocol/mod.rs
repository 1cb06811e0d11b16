// Binary wire codec for the stream protocol.
//
// Split the way the rest of the crate consumes it:
// - encoding: primitive writers and per-command frame builders
// - decoding: bounds-checked readers and typed response parsing
//
// Both halves are pure functions over byte buffers; no I/O happens here.

pub mod decoding;
pub mod encoding;

pub use decoding::{Chunk, FrameHeader, ResponseKind, ServerResponse};
