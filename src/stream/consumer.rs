// Consumer: connection-scoped handle reading one stream from an offset.
//
// Deliveries flow through a bounded channel into a per-consumer task
// that invokes the handler message by message, in server order. The
// handler runs inside that task, so a slow handler back-pressures the
// channel, the reader pump, and ultimately the credit cycle. One credit
// is returned per delivered chunk, after the handler has seen it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::client::ClientInner;
use super::constants::{CLOSE_CHANNEL, COMMAND_QUERY_OFFSET};
use super::error::{Result, StreamError};
use super::offset::OffsetSpecification;
use super::protocol::encoding;
use super::protocol::{Chunk, ResponseKind};
use super::socket::Socket;

/// Handler invoked for every delivered message.
pub type MessagesHandler = Arc<dyn Fn(ConsumerContext, Bytes) + Send + Sync>;

/// Passed to the handler alongside each message.
pub struct ConsumerContext {
    pub consumer: Consumer,
}

/// Options for DeclareSubscriber.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub(crate) offset: OffsetSpecification,
    pub(crate) name: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            offset: OffsetSpecification::First,
            name: None,
        }
    }
}

impl ConsumerOptions {
    pub fn new() -> Self {
        ConsumerOptions::default()
    }

    /// Where to start reading. `LastConsumed` requires a subscription
    /// name, since committed offsets are stored under it.
    pub fn offset(mut self, offset: OffsetSpecification) -> Self {
        self.offset = offset;
        self
    }

    /// Subscription name used as the reference for offset commits and
    /// queries.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Handle to a declared subscription. Cloneable; does not keep the
/// owning client alive.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    id: u8,
    stream: String,
    name: Option<String>,
    client: Weak<ClientInner>,
    offset: AtomicU64,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) fn new(
        id: u8,
        stream: String,
        name: Option<String>,
        client: Weak<ClientInner>,
    ) -> Self {
        Consumer {
            inner: Arc::new(ConsumerInner {
                id,
                stream,
                name,
                client,
                offset: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.inner.id
    }

    pub fn stream(&self) -> &str {
        &self.inner.stream
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Offset of the most recently delivered message. Non-decreasing
    /// for the life of the subscription.
    pub fn current_offset(&self) -> u64 {
        self.inner.offset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_current_offset(&self, offset: u64) {
        self.inner.offset.store(offset, Ordering::SeqCst);
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.inner.client.upgrade().ok_or(StreamError::Closed)
    }

    fn reference(&self) -> &str {
        self.inner.name.as_deref().unwrap_or_default()
    }

    /// Ask the broker for the last offset committed under this
    /// subscription's name.
    pub async fn query_offset(&self) -> Result<u64> {
        let client = self.client()?;
        client.ensure_open()?;

        let waiter = client.coordinator.new_response(COMMAND_QUERY_OFFSET);
        let frame =
            encoding::query_offset(waiter.correlation_id(), self.reference(), &self.inner.stream);
        let response = client.exchange(frame, waiter).await?.ok()?;
        match response.kind {
            ResponseKind::Offset(offset) => {
                self.set_current_offset(offset);
                Ok(offset)
            }
            other => Err(StreamError::protocol(format!(
                "unexpected QueryOffset payload {other:?}"
            ))),
        }
    }

    /// Commit the current offset under the subscription name.
    /// Fire-and-forget: the command carries no correlation id and the
    /// broker sends no reply.
    pub async fn commit(&self) -> Result<()> {
        let client = self.client()?;
        client.ensure_open()?;

        let frame =
            encoding::commit_offset(self.reference(), &self.inner.stream, self.current_offset());
        client.socket.write_and_flush(&frame).await
    }

    /// Unsubscribe on the broker, deregister, and stop the delivery
    /// task. Safe to call more than once, and after the client's own
    /// close cascade.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client = match self.inner.client.upgrade() {
            Some(client) => client,
            None => return Ok(()),
        };
        if client.is_closed() || !client.socket.is_open() {
            let _ = client.coordinator.remove_consumer(self.inner.id);
            return Ok(());
        }
        match client.close_consumer(self.inner.id).await {
            Err(StreamError::ConsumerNotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Per-consumer delivery task. Messages within a chunk are handed to
/// the handler in order; after each chunk one credit goes back to the
/// broker. Exits on the code channel's shutdown signal or when the
/// coordinator drops the delivery sender.
pub(crate) fn spawn_delivery_loop(
    consumer: Consumer,
    handler: MessagesHandler,
    mut deliveries: mpsc::Receiver<Chunk>,
    mut code: mpsc::Receiver<u16>,
    socket: Arc<Socket>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                delivered = deliveries.recv() => match delivered {
                    Some(chunk) => {
                        let mut offset = chunk.first_offset;
                        for message in chunk.messages {
                            consumer.set_current_offset(offset);
                            handler(
                                ConsumerContext {
                                    consumer: consumer.clone(),
                                },
                                message,
                            );
                            offset += 1;
                        }
                        let frame = encoding::credit(consumer.id(), 1);
                        if let Err(e) = socket.write_and_flush(&frame).await {
                            debug!("credit for subscription {} not sent: {e}", consumer.id());
                        }
                    }
                    None => break,
                },
                signal = code.recv() => {
                    if matches!(signal, Some(CLOSE_CHANNEL) | None) {
                        break;
                    }
                }
            }
        }
    });
}
