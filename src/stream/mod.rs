// Stream protocol client implementation.
//
// This module contains all protocol-specific code:
// - Binary frame encoding/decoding (protocol)
// - Socket ownership: serialized writes, the frame reader (socket)
// - The per-connection coordinator: correlation slots, producer and
//   consumer registries, frame routing (coordinator)
// - Connection bring-up and the command surface (client)
// - Producer and consumer lifecycles and flow control
//
// Architecture Overview:
// =====================
//
// One TCP connection multiplexes every logical flow: correlated
// request/response exchanges, asynchronous server-initiated deliveries
// and publish confirms, periodic heartbeats, and the tune negotiation.
//
// Outbound, every operation encodes a frame, registers a pending
// response with the coordinator (obtaining a correlation id), and hands
// the bytes to the socket writer; a mutex serializes whole frames.
//
// Inbound, a single reader task per connection pulls complete frames
// off the socket and asks the coordinator to route them: correlated
// responses to the parked caller, deliveries to the owning consumer's
// bounded channel, confirms and errors to the owning producer, the tune
// body to the slot the SASL step registered under the name "tune".
//
// Background tasks per client: the reader pump, a heartbeat ticker, one
// event loop per producer, one delivery loop per consumer. Each is
// cancellable through its slot's code channel.

pub mod broker;
pub mod client;
pub mod constants;
pub mod consumer;
pub(crate) mod coordinator;
pub mod error;
pub mod logs;
pub mod metadata;
pub mod offset;
pub mod options;
pub mod producer;
pub mod protocol;
pub(crate) mod socket;

// Re-export commonly used types for convenience
pub use broker::Broker;
pub use client::{
    Client, ClientBuilder, MetadataUpdateListener, PublishConfirmListener, PublishErrorListener,
};
pub use constants::response_code_name;
pub use consumer::{Consumer, ConsumerContext, ConsumerOptions, MessagesHandler};
pub use error::{Result, StreamError};
pub use logs::{LogLevel, LogSink, NopSink, TracingSink};
pub use metadata::{MetadataUpdate, StreamMetadata, StreamsMetadata};
pub use offset::OffsetSpecification;
pub use options::{ByteCapacity, StreamOptions};
pub use producer::Producer;
