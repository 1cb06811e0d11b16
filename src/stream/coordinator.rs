// Per-connection coordinator.
//
// Three indexed collections share one home:
// - pending responses, keyed by correlation id, plus a by-name index
//   for frames that are awaited before any correlation id exists (the
//   server-initiated tune, and the heartbeat task's shutdown signal)
// - producers, keyed by their u8 publisher id
// - consumers, keyed by their u8 subscription id
//
// The reader pump feeds every inbound frame to `dispatch`, which routes
// it to the waiting caller or the owning producer/consumer channel.
//
// ## Locking
//
// Each table has its own parking_lot mutex. Lock order is producers ->
// consumers -> responses, never reversed, and no lock is held across an
// await: dispatch clones the destination sender out of the table before
// enqueueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::constants::*;
use super::error::{Result, StreamError};
use super::metadata::MetadataUpdate;
use super::protocol::decoding;
use super::protocol::{Chunk, ServerResponse};

/// Event routed to a producer's background task.
#[derive(Debug)]
pub(crate) enum ProducerEvent {
    Confirmed(Vec<u64>),
    Errored(Vec<(u64, u16)>),
}

pub(crate) struct ProducerEntry {
    pub stream: String,
    pub events: mpsc::UnboundedSender<ProducerEvent>,
}

pub(crate) struct ConsumerEntry {
    pub stream: String,
    pub deliveries: mpsc::Sender<Chunk>,
    pub code: mpsc::Sender<u16>,
}

struct PendingResponse {
    command: u16,
    tx: oneshot::Sender<ServerResponse>,
}

struct NamedSlot {
    data: mpsc::Sender<Bytes>,
    code: mpsc::Sender<u16>,
}

/// Receiver half of a correlated response slot. Exactly one sender,
/// exactly one receiver; the slot is freed on every exit path.
pub(crate) struct ResponseWaiter {
    correlation_id: u32,
    command: u16,
    rx: oneshot::Receiver<ServerResponse>,
}

impl ResponseWaiter {
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// Await the response, bounded by the call timeout. On delivery the
    /// dispatcher has already removed the slot; on timeout or a torn
    /// down connection this removes it before surfacing the error.
    pub async fn wait(self, coordinator: &Coordinator) -> Result<ServerResponse> {
        match timeout(DEFAULT_CALL_TIMEOUT, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                let _ = coordinator.remove_response(self.correlation_id);
                Err(StreamError::Closed)
            }
            Err(_) => {
                let _ = coordinator.remove_response(self.correlation_id);
                Err(StreamError::Timeout {
                    command: command_name(self.command),
                })
            }
        }
    }
}

/// Receiver half of a named slot: a data channel (tune body bytes) and
/// a code channel (task shutdown rendezvous).
pub(crate) struct NamedWaiter {
    name: &'static str,
    pub data: mpsc::Receiver<Bytes>,
    pub code: mpsc::Receiver<u16>,
}

impl NamedWaiter {
    /// Await the data payload, bounded by the call timeout.
    pub async fn wait_data(&mut self) -> Result<Bytes> {
        match timeout(DEFAULT_CALL_TIMEOUT, self.data.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(StreamError::Closed),
            Err(_) => Err(StreamError::Timeout { command: self.name }),
        }
    }
}

pub(crate) struct Coordinator {
    correlation: AtomicU32,
    producers: Mutex<HashMap<u8, ProducerEntry>>,
    consumers: Mutex<HashMap<u8, ConsumerEntry>>,
    responses: Mutex<HashMap<u32, PendingResponse>>,
    named: Mutex<HashMap<&'static str, NamedSlot>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator {
            correlation: AtomicU32::new(0),
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            named: Mutex::new(HashMap::new()),
        }
    }

    // ===== Correlated response slots =====

    /// Allocate the next correlation id and register a slot for it.
    pub fn new_response(&self, command: u16) -> ResponseWaiter {
        let correlation_id = self.correlation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.responses
            .lock()
            .insert(correlation_id, PendingResponse { command, tx });
        ResponseWaiter {
            correlation_id,
            command,
            rx,
        }
    }

    /// Register a slot under a symbolic name, for frames whose
    /// correlation id is unknown in advance.
    pub fn new_response_named(&self, name: &'static str) -> NamedWaiter {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (code_tx, code_rx) = mpsc::channel(1);
        self.named.lock().insert(
            name,
            NamedSlot {
                data: data_tx,
                code: code_tx,
            },
        );
        NamedWaiter {
            name,
            data: data_rx,
            code: code_rx,
        }
    }

    pub fn remove_response(&self, correlation_id: u32) -> Result<()> {
        match self.responses.lock().remove(&correlation_id) {
            Some(_) => Ok(()),
            None => Err(StreamError::ResponseNotFound { correlation_id }),
        }
    }

    pub fn remove_response_named(&self, name: &str) -> Result<()> {
        match self.named.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(StreamError::NamedResponseNotFound { name: name.into() }),
        }
    }

    /// Deliver a shutdown code to a named slot's code channel.
    pub fn signal_named(&self, name: &str, code: u16) -> Result<()> {
        let slot = self.named.lock().get(name).map(|s| s.code.clone());
        match slot {
            Some(tx) => {
                // capacity 1: a second signal is already covered by the first
                let _ = tx.try_send(code);
                Ok(())
            }
            None => Err(StreamError::NamedResponseNotFound { name: name.into() }),
        }
    }

    // ===== Producer / consumer registries =====

    /// Register a producer under the lowest free id in [0, 255].
    pub fn register_producer(&self, entry: ProducerEntry) -> Result<u8> {
        let mut producers = self.producers.lock();
        let id = lowest_free_id(&producers).ok_or(StreamError::TooManyProducers)?;
        producers.insert(id, entry);
        Ok(id)
    }

    pub fn remove_producer(&self, id: u8) -> Result<()> {
        match self.producers.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(StreamError::ProducerNotFound { id }),
        }
    }

    pub fn producer_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.producers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Register a consumer under the lowest free id in [0, 255].
    pub fn register_consumer(&self, entry: ConsumerEntry) -> Result<u8> {
        let mut consumers = self.consumers.lock();
        let id = lowest_free_id(&consumers).ok_or(StreamError::TooManyConsumers)?;
        consumers.insert(id, entry);
        Ok(id)
    }

    pub fn remove_consumer(&self, id: u8) -> Result<()> {
        match self.consumers.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(StreamError::ConsumerNotFound { id }),
        }
    }

    pub fn consumer_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.consumers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Signal a consumer's delivery task to stop.
    pub fn signal_consumer(&self, id: u8, code: u16) -> Result<()> {
        let tx = self.consumers.lock().get(&id).map(|e| e.code.clone());
        match tx {
            Some(tx) => {
                let _ = tx.try_send(code);
                Ok(())
            }
            None => Err(StreamError::ConsumerNotFound { id }),
        }
    }

    // ===== Frame routing =====

    /// Route one inbound frame (size prefix already stripped).
    ///
    /// Correlated responses are matched to their slot and the slot is
    /// freed. Server-push frames go to the owning producer/consumer
    /// channel, the tune slot, or back to the caller (MetadataUpdate,
    /// which the reader forwards to the client's listener).
    pub async fn dispatch(&self, mut frame: Bytes) -> Result<Option<MetadataUpdate>> {
        let header = decoding::read_header(&mut frame)?;

        if header.is_response {
            // Credit error responses are the one response shape without
            // a correlation id.
            if header.key == COMMAND_CREDIT {
                let code = decoding::read_u16(&mut frame, "credit response code")?;
                let subscription_id = decoding::read_u8(&mut frame, "subscription id")?;
                warn!(
                    "credit rejected for subscription {subscription_id}: {}",
                    response_code_name(code)
                );
                return Ok(None);
            }

            let correlation_id = decoding::read_u32(&mut frame, "correlation id")?;
            let response = decoding::read_response(header.key, &mut frame)?;
            let pending = self.responses.lock().remove(&correlation_id);
            match pending {
                Some(pending) => {
                    let _ = pending.tx.send(response);
                }
                None => warn!(
                    "no pending response for correlation id {correlation_id} ({})",
                    command_name(header.key)
                ),
            }
            return Ok(None);
        }

        match header.key {
            COMMAND_DELIVER => {
                let (subscription_id, chunk) = decoding::read_deliver(&mut frame)?;
                let deliveries = self
                    .consumers
                    .lock()
                    .get(&subscription_id)
                    .map(|e| e.deliveries.clone());
                match deliveries {
                    // Bounded channel: when the consumer lags, this send
                    // blocks the reader pump, pushing back on the TCP
                    // receive window.
                    Some(tx) => {
                        if tx.send(chunk).await.is_err() {
                            debug!("dropping chunk for closed subscription {subscription_id}");
                        }
                    }
                    None => warn!("delivery for unknown subscription id {subscription_id}"),
                }
                Ok(None)
            }
            COMMAND_PUBLISH_CONFIRM => {
                let (publisher_id, ids) = decoding::read_publish_confirm(&mut frame)?;
                self.route_producer_event(publisher_id, ProducerEvent::Confirmed(ids));
                Ok(None)
            }
            COMMAND_PUBLISH_ERROR => {
                let (publisher_id, errors) = decoding::read_publish_error(&mut frame)?;
                self.route_producer_event(publisher_id, ProducerEvent::Errored(errors));
                Ok(None)
            }
            COMMAND_TUNE => {
                // Raw body bytes go to the slot the SASL step registered;
                // the client echoes them back verbatim.
                let tune = self.named.lock().get("tune").map(|slot| slot.data.clone());
                match tune {
                    Some(tx) => {
                        let _ = tx.try_send(frame);
                    }
                    None => warn!("unsolicited tune frame discarded"),
                }
                Ok(None)
            }
            COMMAND_HEARTBEAT => {
                // Liveness is maintained by the periodic sender.
                Ok(None)
            }
            COMMAND_METADATA_UPDATE => Ok(Some(decoding::read_metadata_update(&mut frame)?)),
            COMMAND_CLOSE => {
                let code = decoding::read_u16(&mut frame, "close code")?;
                let reason = decoding::read_string(&mut frame).unwrap_or_default();
                warn!(
                    "broker requested close: {} {reason:?}",
                    response_code_name(code)
                );
                Ok(None)
            }
            key => Err(StreamError::protocol(format!(
                "unexpected command key {key}"
            ))),
        }
    }

    fn route_producer_event(&self, publisher_id: u8, event: ProducerEvent) {
        let events = self
            .producers
            .lock()
            .get(&publisher_id)
            .map(|e| e.events.clone());
        match events {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => warn!("publish event for unknown publisher id {publisher_id}"),
        }
    }

    /// Tear down every registered slot and registry entry. Dropping the
    /// senders makes every waiting caller observe `closed` and every
    /// background task drain and exit.
    pub fn fail_all(&self) {
        self.producers.lock().clear();
        self.consumers.lock().clear();
        self.responses.lock().clear();
        self.named.lock().clear();
    }

    #[cfg(test)]
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().len()
    }
}

fn lowest_free_id<T>(map: &HashMap<u8, T>) -> Option<u8> {
    (0..=255u8).find(|id| !map.contains_key(id))
}
