// Client: connection bring-up and the command surface.
//
// Connect sequence, strictly ordered:
//   1. parse URI, dial TCP, spawn the reader pump
//   2. peer-properties exchange
//   3. SASL handshake (PLAIN required)
//   4. SASL authenticate; the broker answers with a server-initiated
//      Tune frame, which is echoed back verbatim
//   5. open the virtual host
//   6. start the heartbeat ticker
//
// Between a successful connect and close, exactly one reader task runs
// per client. Close cascades over every registered producer and
// consumer before the Close frame goes out, and is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::broker::Broker;
use super::constants::*;
use super::consumer::{spawn_delivery_loop, Consumer, ConsumerOptions, MessagesHandler};
use super::coordinator::{ConsumerEntry, Coordinator, ProducerEntry, ResponseWaiter};
use super::error::{Result, StreamError};
use super::logs::{LogSink, TracingSink};
use super::metadata::{MetadataUpdate, StreamsMetadata};
use super::offset::OffsetSpecification;
use super::options::StreamOptions;
use super::producer::{spawn_event_loop, Producer};
use super::protocol::decoding;
use super::protocol::encoding;
use super::protocol::{ResponseKind, ServerResponse};
use super::socket::{read_frame, Socket};

/// Invoked with (publisher id, publishing id, code, code name) for each
/// broker-reported publish error.
pub type PublishErrorListener = Arc<dyn Fn(u8, u64, u16, &str) + Send + Sync>;

/// Invoked with (publisher id, confirmed publishing ids) for each
/// PublishConfirm frame.
pub type PublishConfirmListener = Arc<dyn Fn(u8, &[u64]) + Send + Sync>;

/// Invoked for each unsolicited MetadataUpdate frame.
pub type MetadataUpdateListener = Arc<dyn Fn(&MetadataUpdate) + Send + Sync>;

/// Requested tune parameters, sent implicitly by echoing the broker's
/// Tune frame (the broker's values win).
#[derive(Debug, Clone, Copy)]
pub struct TuneState {
    pub requested_heartbeat: u32,
    pub requested_max_frame_size: u32,
}

/// Builder for [`Client`]. Defaults target a local broker with guest
/// credentials.
pub struct ClientBuilder {
    uri: String,
    connection_name: String,
    publish_error_listener: Option<PublishErrorListener>,
    publish_confirm_listener: Option<PublishConfirmListener>,
    metadata_update_listener: Option<MetadataUpdateListener>,
    log: Arc<dyn LogSink>,
}

impl ClientBuilder {
    fn new() -> Self {
        ClientBuilder {
            uri: LOCALHOST_URI.to_string(),
            connection_name: "rmq-stream-locator".to_string(),
            publish_error_listener: None,
            publish_confirm_listener: None,
            metadata_update_listener: None,
            log: Arc::new(TracingSink),
        }
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Connection name reported to the broker in the client properties.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn publish_error_listener(mut self, listener: PublishErrorListener) -> Self {
        self.publish_error_listener = Some(listener);
        self
    }

    pub fn publish_confirm_listener(mut self, listener: PublishConfirmListener) -> Self {
        self.publish_confirm_listener = Some(listener);
        self
    }

    pub fn metadata_update_listener(mut self, listener: MetadataUpdateListener) -> Self {
        self.metadata_update_listener = Some(listener);
        self
    }

    pub fn log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    /// Dial the broker and run the handshake. On any handshake failure
    /// the connection is torn down before the error is returned.
    pub async fn connect(self) -> Result<Client> {
        let broker = Broker::from_uri(&self.uri)?;

        let tcp = TcpStream::connect((broker.host.as_str(), broker.port)).await?;
        let (read_half, write_half) = tcp.into_split();
        let socket = Arc::new(Socket::new(write_half));
        let coordinator = Arc::new(Coordinator::new());

        spawn_reader(
            BufReader::with_capacity(DEFAULT_SOCKET_BUFFER, read_half),
            socket.clone(),
            coordinator.clone(),
            self.metadata_update_listener.clone(),
            self.log.clone(),
        );

        let inner = Arc::new(ClientInner {
            broker,
            socket,
            coordinator,
            tune: TuneState {
                requested_heartbeat: DEFAULT_HEARTBEAT_SECS,
                requested_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            },
            server_properties: Mutex::new(Vec::new()),
            publish_error_listener: self.publish_error_listener,
            publish_confirm_listener: self.publish_confirm_listener,
            log: self.log,
            closed: AtomicBool::new(false),
        });

        if let Err(e) = inner.handshake(&self.connection_name).await {
            inner.socket.shutdown(Some(&e)).await;
            inner.coordinator.fail_all();
            return Err(e);
        }
        inner.start_heartbeat();
        inner.log.debug(&format!(
            "user {} connected to {}:{}, vhost {:?}",
            inner.broker.user, inner.broker.host, inner.broker.port, inner.broker.vhost
        ));

        Ok(Client { inner })
    }
}

/// Handle to one broker connection. Cloneable; all clones share the
/// connection and close() is idempotent across them.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("broker", &self.inner.broker)
            .finish()
    }
}

pub(crate) struct ClientInner {
    pub(crate) broker: Broker,
    pub(crate) socket: Arc<Socket>,
    pub(crate) coordinator: Arc<Coordinator>,
    #[allow(dead_code)]
    pub(crate) tune: TuneState,
    server_properties: Mutex<Vec<(String, String)>>,
    publish_error_listener: Option<PublishErrorListener>,
    publish_confirm_listener: Option<PublishConfirmListener>,
    pub(crate) log: Arc<dyn LogSink>,
    closed: AtomicBool,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with defaults to the given URI.
    pub async fn connect(uri: &str) -> Result<Client> {
        Client::builder().uri(uri).connect().await
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.socket.is_open()
    }

    /// Properties the broker reported during the handshake.
    pub fn server_properties(&self) -> Vec<(String, String)> {
        self.inner.server_properties.lock().clone()
    }

    /// Create a stream. An empty name is rejected locally, before any
    /// frame goes out.
    pub async fn declare_stream(&self, stream: &str, options: &StreamOptions) -> Result<()> {
        validate_stream_name(stream)?;
        self.inner.ensure_open()?;

        let args = options.build_parameters();
        let waiter = self.inner.coordinator.new_response(COMMAND_CREATE_STREAM);
        let frame = encoding::create_stream(waiter.correlation_id(), stream, &args);
        self.inner.exchange(frame, waiter).await?.ok()?;
        Ok(())
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<()> {
        validate_stream_name(stream)?;
        self.inner.ensure_open()?;

        let waiter = self.inner.coordinator.new_response(COMMAND_DELETE_STREAM);
        let frame = encoding::delete_stream(waiter.correlation_id(), stream);
        self.inner.exchange(frame, waiter).await?.ok()?;
        Ok(())
    }

    /// Declare a publisher and return its producer handle. The id is
    /// released again if the broker rejects the declaration.
    pub async fn declare_publisher(&self, stream: &str) -> Result<Producer> {
        validate_stream_name(stream)?;
        self.inner.ensure_open()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self.inner.coordinator.register_producer(ProducerEntry {
            stream: stream.to_string(),
            events: events_tx,
        })?;

        let waiter = self.inner.coordinator.new_response(COMMAND_DECLARE_PUBLISHER);
        let frame = encoding::declare_publisher(waiter.correlation_id(), id, stream);
        if let Err(e) = self
            .inner
            .exchange(frame, waiter)
            .await
            .and_then(|r| r.ok())
        {
            let _ = self.inner.coordinator.remove_producer(id);
            return Err(e);
        }

        spawn_event_loop(
            id,
            events_rx,
            self.inner.publish_confirm_listener.clone(),
            self.inner.publish_error_listener.clone(),
            self.inner.log.clone(),
        );
        Ok(Producer::new(
            id,
            stream.to_string(),
            Arc::downgrade(&self.inner),
        ))
    }

    /// Subscribe to a stream with an initial credit of 10. A
    /// `LastConsumed` offset is resolved via QueryOffset first; if the
    /// query fails, the subscription id is released and the error
    /// surfaces.
    pub async fn declare_subscriber(
        &self,
        stream: &str,
        handler: MessagesHandler,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        validate_stream_name(stream)?;
        self.inner.ensure_open()?;

        let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let (code_tx, code_rx) = mpsc::channel(1);
        let id = self.inner.coordinator.register_consumer(ConsumerEntry {
            stream: stream.to_string(),
            deliveries: deliveries_tx,
            code: code_tx,
        })?;

        let consumer = Consumer::new(
            id,
            stream.to_string(),
            options.name.clone(),
            Arc::downgrade(&self.inner),
        );

        // LastConsumed is client-side only: rewrite it to the queried
        // offset before it reaches the wire.
        let mut offset_spec = options.offset;
        if offset_spec.is_last_consumed() {
            match consumer.query_offset().await {
                Ok(last) => offset_spec = OffsetSpecification::Offset(last),
                Err(e) => {
                    let _ = self.inner.coordinator.remove_consumer(id);
                    return Err(e);
                }
            }
        }

        let waiter = self.inner.coordinator.new_response(COMMAND_SUBSCRIBE);
        let frame = match encoding::subscribe(
            waiter.correlation_id(),
            id,
            stream,
            &offset_spec,
            DEFAULT_INITIAL_CREDIT,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = self.inner.coordinator.remove_response(waiter.correlation_id());
                let _ = self.inner.coordinator.remove_consumer(id);
                return Err(e);
            }
        };
        if let Err(e) = self
            .inner
            .exchange(frame, waiter)
            .await
            .and_then(|r| r.ok())
        {
            let _ = self.inner.coordinator.remove_consumer(id);
            return Err(e);
        }

        if let OffsetSpecification::Offset(offset) = offset_spec {
            consumer.set_current_offset(offset);
        }

        spawn_delivery_loop(
            consumer.clone(),
            handler,
            deliveries_rx,
            code_rx,
            self.inner.socket.clone(),
        );
        Ok(consumer)
    }

    /// Query stream metadata: leader and replicas per stream.
    pub async fn metadata(&self, streams: &[&str]) -> Result<StreamsMetadata> {
        self.inner.ensure_open()?;

        let names: Vec<String> = streams.iter().map(|s| s.to_string()).collect();
        let waiter = self.inner.coordinator.new_response(COMMAND_METADATA);
        let frame = encoding::metadata_query(waiter.correlation_id(), &names);
        let response = self.inner.exchange(frame, waiter).await?;
        match response.kind {
            ResponseKind::Metadata(metadata) => Ok(metadata),
            other => Err(StreamError::protocol(format!(
                "unexpected Metadata payload {other:?}"
            ))),
        }
    }

    /// The leader broker for a stream, or the stream's error code.
    pub async fn broker_leader(&self, stream: &str) -> Result<Broker> {
        let metadata = self.metadata(&[stream]).await?;
        let entry = metadata.get(stream).ok_or(StreamError::Broker {
            code: RESPONSE_CODE_STREAM_DOES_NOT_EXIST,
        })?;
        if entry.response_code != RESPONSE_CODE_OK {
            return Err(StreamError::Broker {
                code: entry.response_code,
            });
        }
        entry.leader.clone().ok_or_else(|| {
            StreamError::protocol(format!("metadata for {stream:?} reports no leader"))
        })
    }

    /// Close the connection: every producer and consumer is closed
    /// first (logging, not failing, on individual errors), then the
    /// heartbeat stops, a Close frame with code OK goes out while the
    /// socket is still open, and the socket shuts down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for id in self.inner.coordinator.producer_ids() {
            if let Err(e) = self.inner.close_producer(id).await {
                self.inner.log.warn(&format!("error closing producer {id}: {e}"));
            }
        }
        for id in self.inner.coordinator.consumer_ids() {
            if let Err(e) = self.inner.close_consumer(id).await {
                self.inner.log.warn(&format!("error closing consumer {id}: {e}"));
            }
        }

        let _ = self.inner.coordinator.signal_named("heartbeat", CLOSE_CHANNEL);

        if self.inner.socket.is_open() {
            let waiter = self.inner.coordinator.new_response(COMMAND_CLOSE);
            let frame = encoding::close_ok(waiter.correlation_id());
            if let Err(e) = self.inner.socket.write_and_flush(&frame).await {
                self.inner.log.warn(&format!("error sending close frame: {e}"));
            }
            let _ = self.inner.coordinator.remove_response(waiter.correlation_id());
        }

        self.inner.socket.shutdown(None).await;
        self.inner.coordinator.fail_all();
        Ok(())
    }
}

impl ClientInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || !self.socket.is_open() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    /// Write a correlated request and await its response. The slot is
    /// freed on every path, including write failure.
    pub(crate) async fn exchange(
        &self,
        frame: Bytes,
        waiter: ResponseWaiter,
    ) -> Result<ServerResponse> {
        if let Err(e) = self.socket.write_and_flush(&frame).await {
            let _ = self.coordinator.remove_response(waiter.correlation_id());
            return Err(e);
        }
        waiter.wait(&self.coordinator).await
    }

    async fn handshake(&self, connection_name: &str) -> Result<()> {
        self.peer_properties(connection_name).await?;
        self.authenticate().await?;
        self.open().await?;
        Ok(())
    }

    async fn peer_properties(&self, connection_name: &str) -> Result<()> {
        let properties: Vec<(String, String)> = [
            ("connection_name", connection_name),
            ("product", "RabbitMQ Stream"),
            ("copyright", "Copyright (c) 2021 VMware, Inc. or its affiliates."),
            (
                "information",
                "Licensed under the MPL 2.0. See https://www.rabbitmq.com/",
            ),
            ("version", CLIENT_VERSION),
            ("platform", "Rust"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let waiter = self.coordinator.new_response(COMMAND_PEER_PROPERTIES);
        let frame = encoding::peer_properties(waiter.correlation_id(), &properties);
        let response = self.exchange(frame, waiter).await?.ok()?;
        if let ResponseKind::Properties(server_properties) = response.kind {
            *self.server_properties.lock() = server_properties;
        }
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let mechanisms = self.sasl_handshake().await?;
        if !mechanisms.iter().any(|m| m == "PLAIN") {
            return Err(StreamError::Authentication {
                message: format!("sasl mechanism not supported, broker offers {mechanisms:?}"),
            });
        }

        // PLAIN challenge response: \0user\0password
        let mut challenge =
            Vec::with_capacity(self.broker.user.len() + self.broker.password.len() + 2);
        challenge.push(0);
        challenge.extend_from_slice(self.broker.user.as_bytes());
        challenge.push(0);
        challenge.extend_from_slice(self.broker.password.as_bytes());

        self.sasl_authenticate("PLAIN", &challenge).await
    }

    async fn sasl_handshake(&self) -> Result<Vec<String>> {
        let waiter = self.coordinator.new_response(COMMAND_SASL_HANDSHAKE);
        let frame = encoding::sasl_handshake(waiter.correlation_id());
        let response = self.exchange(frame, waiter).await?.ok()?;
        match response.kind {
            ResponseKind::Mechanisms(mechanisms) => Ok(mechanisms),
            other => Err(StreamError::protocol(format!(
                "unexpected SaslHandshake payload {other:?}"
            ))),
        }
    }

    /// Authenticate, then complete the tune exchange: the broker
    /// replies with a server-initiated Tune frame whose raw body is
    /// looked up via the pre-registered "tune" slot and echoed back
    /// verbatim (the broker's values win).
    async fn sasl_authenticate(&self, mechanism: &str, challenge: &[u8]) -> Result<()> {
        let mut tune_waiter = self.coordinator.new_response_named("tune");

        let waiter = self.coordinator.new_response(COMMAND_SASL_AUTHENTICATE);
        let frame = encoding::sasl_authenticate(waiter.correlation_id(), mechanism, challenge);
        let response = match self.exchange(frame, waiter).await {
            Ok(response) => response,
            Err(e) => {
                let _ = self.coordinator.remove_response_named("tune");
                return Err(e);
            }
        };
        if response.code != RESPONSE_CODE_OK {
            let _ = self.coordinator.remove_response_named("tune");
            return Err(StreamError::Authentication {
                message: response_code_name(response.code).to_string(),
            });
        }

        let tune_body = match tune_waiter.wait_data().await {
            Ok(body) => body,
            Err(e) => {
                let _ = self.coordinator.remove_response_named("tune");
                return Err(e);
            }
        };
        self.coordinator.remove_response_named("tune")?;

        if let Ok((max_frame_size, heartbeat)) = decoding::read_tune(&mut tune_body.clone()) {
            self.log.debug(&format!(
                "tuned: max frame size {max_frame_size}, heartbeat {heartbeat}s"
            ));
        }
        self.socket
            .write_and_flush(&encoding::tune_echo(&tune_body))
            .await
    }

    async fn open(&self) -> Result<()> {
        let waiter = self.coordinator.new_response(COMMAND_OPEN);
        let frame = encoding::open(waiter.correlation_id(), &self.broker.vhost);
        // the response carries a property map we have no use for
        self.exchange(frame, waiter).await?.ok()?;
        Ok(())
    }

    /// Heartbeat ticker: one frame per cadence period, stopped through
    /// the "heartbeat" slot's code channel. Send failures log a
    /// warning; the peer's own timeout handles a dead connection.
    fn start_heartbeat(self: &Arc<Self>) {
        let mut waiter = self.coordinator.new_response_named("heartbeat");
        let socket = self.socket.clone();
        let coordinator = self.coordinator.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(DEFAULT_HEARTBEAT_SECS as u64);
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    signal = waiter.code.recv() => {
                        if matches!(signal, Some(CLOSE_CHANNEL) | None) {
                            let _ = coordinator.remove_response_named("heartbeat");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = socket.write_and_flush(&encoding::heartbeat()).await {
                            log.warn(&format!("heartbeat send failed: {e}"));
                        }
                    }
                }
            }
        });
    }

    /// Delete a publisher on the broker and deregister it.
    pub(crate) async fn close_producer(&self, id: u8) -> Result<()> {
        let waiter = self.coordinator.new_response(COMMAND_DELETE_PUBLISHER);
        let frame = encoding::delete_publisher(waiter.correlation_id(), id);
        let result = self.exchange(frame, waiter).await.and_then(|r| r.ok());
        let removed = self.coordinator.remove_producer(id);
        result?;
        removed?;
        Ok(())
    }

    /// Unsubscribe on the broker, stop the delivery task, deregister.
    pub(crate) async fn close_consumer(&self, id: u8) -> Result<()> {
        let waiter = self.coordinator.new_response(COMMAND_UNSUBSCRIBE);
        let frame = encoding::unsubscribe(waiter.correlation_id(), id);
        let result = self.exchange(frame, waiter).await.and_then(|r| r.ok());
        let _ = self.coordinator.signal_consumer(id, CLOSE_CHANNEL);
        let removed = self.coordinator.remove_consumer(id);
        result?;
        removed?;
        Ok(())
    }
}

/// The per-connection reader pump: reads complete frames and routes
/// them through the coordinator until EOF or an error, then tears the
/// connection down and fails all outstanding waiters.
fn spawn_reader(
    mut reader: BufReader<OwnedReadHalf>,
    socket: Arc<Socket>,
    coordinator: Arc<Coordinator>,
    metadata_update_listener: Option<MetadataUpdateListener>,
    log: Arc<dyn LogSink>,
) {
    tokio::spawn(async move {
        let mut cause: Option<StreamError> = None;
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match coordinator.dispatch(frame).await {
                    Ok(Some(update)) => {
                        log.debug(&format!(
                            "metadata update for {:?}: {}",
                            update.stream,
                            response_code_name(update.code)
                        ));
                        if let Some(listener) = &metadata_update_listener {
                            listener(&update);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        cause = Some(e);
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    cause = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = &cause {
            log.warn(&format!("reader stopped: {e}"));
        }
        socket.shutdown(cause.as_ref()).await;
        let _ = coordinator.signal_named("heartbeat", CLOSE_CHANNEL);
        coordinator.fail_all();
    });
}

fn validate_stream_name(stream: &str) -> Result<()> {
    if stream.is_empty() {
        Err(StreamError::invalid_argument("stream name can't be empty"))
    } else {
        Ok(())
    }
}
