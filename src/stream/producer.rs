// Producer: connection-scoped handle appending to one stream.
//
// Publishing ids are assigned client-side from a monotonic counter;
// within one batch they are contiguous. Confirms and errors arrive
// asynchronously on the producer's event channel and are forwarded to
// the client's listeners by a per-producer background task.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::client::{ClientInner, PublishConfirmListener, PublishErrorListener};
use super::constants::{response_code_name, COMMAND_QUERY_PUBLISHER_SEQUENCE};
use super::coordinator::ProducerEvent;
use super::error::{Result, StreamError};
use super::logs::LogSink;
use super::protocol::encoding;
use super::protocol::ResponseKind;

/// Handle to a declared publisher. Cloneable; does not keep the owning
/// client alive.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    id: u8,
    stream: String,
    client: Weak<ClientInner>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl Producer {
    pub(crate) fn new(id: u8, stream: String, client: Weak<ClientInner>) -> Self {
        Producer {
            inner: Arc::new(ProducerInner {
                id,
                stream,
                client,
                sequence: AtomicU64::new(0),
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

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.inner.client.upgrade().ok_or(StreamError::Closed)
    }

    /// Publish a batch of opaque message bodies in one frame.
    ///
    /// Returns the publishing-id range assigned to the batch; the ids
    /// are contiguous and strictly monotonic across batches until the
    /// producer closes. Confirmation is asynchronous: it reaches the
    /// client's confirm listener, never this call.
    pub async fn batch_publish(&self, messages: &[Bytes]) -> Result<Range<u64>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let client = self.client()?;
        client.ensure_open()?;

        let count = messages.len() as u64;
        if count == 0 {
            let next = self.inner.sequence.load(Ordering::SeqCst);
            return Ok(next..next);
        }

        let first = self.inner.sequence.fetch_add(count, Ordering::SeqCst);
        let batch: Vec<(u64, Bytes)> = messages
            .iter()
            .enumerate()
            .map(|(i, body)| (first + i as u64, body.clone()))
            .collect();

        let frame = encoding::publish(self.inner.id, &batch);
        client.socket.write_and_flush(&frame).await?;
        Ok(first..first + count)
    }

    /// Ask the broker for the last publishing id it stored for this
    /// stream.
    pub async fn get_last_publishing_id(&self) -> Result<u64> {
        let client = self.client()?;
        client.ensure_open()?;

        let waiter = client.coordinator.new_response(COMMAND_QUERY_PUBLISHER_SEQUENCE);
        let frame =
            encoding::query_publisher_sequence(waiter.correlation_id(), "", &self.inner.stream);
        let response = client.exchange(frame, waiter).await?.ok()?;
        match response.kind {
            ResponseKind::Sequence(sequence) => Ok(sequence),
            other => Err(StreamError::protocol(format!(
                "unexpected QueryPublisherSequence payload {other:?}"
            ))),
        }
    }

    /// Delete the publisher on the broker and deregister it. Safe to
    /// call more than once, and after the client's own close cascade.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client = match self.inner.client.upgrade() {
            Some(client) => client,
            None => return Ok(()),
        };
        if client.is_closed() || !client.socket.is_open() {
            let _ = client.coordinator.remove_producer(self.inner.id);
            return Ok(());
        }
        match client.close_producer(self.inner.id).await {
            Err(StreamError::ProducerNotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Per-producer task: drains the event channel, forwarding confirms to
/// the confirm listener and errors to the publish-error listener. Exits
/// when the coordinator drops the sender.
pub(crate) fn spawn_event_loop(
    publisher_id: u8,
    mut events: mpsc::UnboundedReceiver<ProducerEvent>,
    confirm_listener: Option<PublishConfirmListener>,
    error_listener: Option<PublishErrorListener>,
    log: Arc<dyn LogSink>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProducerEvent::Confirmed(ids) => {
                    if let Some(listener) = &confirm_listener {
                        listener(publisher_id, &ids);
                    }
                }
                ProducerEvent::Errored(errors) => {
                    for (publishing_id, code) in errors {
                        match &error_listener {
                            Some(listener) => {
                                listener(publisher_id, publishing_id, code, response_code_name(code))
                            }
                            None => log.warn(&format!(
                                "publish error for publisher {publisher_id}, publishing id \
                                 {publishing_id}: {}",
                                response_code_name(code)
                            )),
                        }
                    }
                }
            }
        }
    });
}
