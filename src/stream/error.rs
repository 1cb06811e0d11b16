//! Error types for the stream client.
//!
//! Every fallible operation returns [`StreamError`]. Broker-reported
//! failures keep their wire code so callers can match on the specific
//! condition; everything else maps to one of a small set of client-side
//! kinds (transport, protocol, timeout, authentication, resource
//! exhaustion, invalid argument, closed).

use thiserror::Error;

use super::constants::response_code_name;

/// Errors surfaced by client, producer and consumer operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Socket I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed frame, unknown command or version mismatch.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// No response arrived within the call timeout. The correlation slot
    /// has been released.
    #[error("timed out waiting for {command} response")]
    Timeout { command: &'static str },

    /// SASL was rejected or no supported mechanism was offered.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The broker answered with a non-OK response code.
    #[error("broker error {code}: {}", response_code_name(*.code))]
    Broker { code: u16 },

    /// All 256 producer ids on this connection are in use.
    #[error("too many producers: no free id in [0, 255]")]
    TooManyProducers,

    /// All 256 consumer ids on this connection are in use.
    #[error("too many consumers: no free id in [0, 255]")]
    TooManyConsumers,

    /// The caller passed an argument the client rejects locally, before
    /// contacting the broker.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The operation ran against a closed client or connection.
    #[error("client is closed")]
    Closed,

    /// Internal registry: no pending response for this correlation id.
    #[error("no pending response for correlation id {correlation_id}")]
    ResponseNotFound { correlation_id: u32 },

    /// Internal registry: no pending response registered under this name.
    #[error("no pending response named {name:?}")]
    NamedResponseNotFound { name: String },

    /// Internal registry: producer id not found.
    #[error("producer id {id} not found")]
    ProducerNotFound { id: u8 },

    /// Internal registry: consumer id not found.
    #[error("consumer id {id} not found")]
    ConsumerNotFound { id: u8 },
}

impl StreamError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        StreamError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        StreamError::InvalidArgument {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
