// End-to-end client tests against the in-process mock broker.
//
// Covers the full handshake, stream management, publish/confirm,
// subscribe/deliver/credit/commit, the close cascade, and the response
// timeout, all over a real TCP socket.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use helpers::{BrokerBehavior, MockBroker};
use rmq_stream::stream::constants::*;
use rmq_stream::{Client, ConsumerOptions, OffsetSpecification, StreamError, StreamOptions};

async fn connect(broker: &MockBroker) -> Client {
    Client::connect(&broker.uri()).await.expect("connect failed")
}

#[tokio::test]
async fn test_handshake_success() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    assert!(client.is_open());
    assert!(client
        .server_properties()
        .iter()
        .any(|(k, v)| k == "product" && v == "mock-broker"));

    let state = broker.state();
    assert_eq!(
        &state.frame_keys()[..5],
        &[
            COMMAND_PEER_PROPERTIES,
            COMMAND_SASL_HANDSHAKE,
            COMMAND_SASL_AUTHENTICATE,
            COMMAND_TUNE,
            COMMAND_OPEN,
        ],
        "handshake frames out of order"
    );

    // PLAIN challenge response: \0user\0password
    assert_eq!(state.auth_payload.as_deref(), Some(&b"\0guest\0guest"[..]));

    // six client properties reported
    let mut peer_properties = state.first_body(COMMAND_PEER_PROPERTIES).unwrap();
    peer_properties.get_u32(); // correlation id
    assert_eq!(peer_properties.get_i32(), 6);

    // the broker's tune values echoed back verbatim
    let mut tune = state.first_body(COMMAND_TUNE).unwrap();
    assert_eq!(tune.get_u32(), DEFAULT_MAX_FRAME_SIZE);
    assert_eq!(tune.get_u32(), DEFAULT_HEARTBEAT_SECS);
    drop(state);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_plain_unsupported_fails_authentication() {
    let behavior = BrokerBehavior {
        mechanisms: vec!["EXTERNAL".to_string()],
        ..BrokerBehavior::default()
    };
    let broker = MockBroker::start(behavior).await;

    let err = Client::connect(&broker.uri()).await.unwrap_err();
    assert!(
        matches!(err, StreamError::Authentication { .. }),
        "expected authentication error, got {err:?}"
    );
}

#[tokio::test]
async fn test_declare_stream_and_duplicate() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    client.declare_stream("s1", &StreamOptions::new()).await.unwrap();

    let err = client
        .declare_stream("s1", &StreamOptions::new())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            StreamError::Broker {
                code: RESPONSE_CODE_STREAM_ALREADY_EXISTS
            }
        ),
        "expected StreamAlreadyExists, got {err:?}"
    );

    // delete, then re-create succeeds
    client.delete_stream("s1").await.unwrap();
    client.declare_stream("s1", &StreamOptions::new()).await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_declare_stream_empty_name_is_local() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let err = client
        .declare_stream("", &StreamOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidArgument { .. }));
    assert_eq!(broker.state().count(COMMAND_CREATE_STREAM), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_batch_publish_and_confirms() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;

    let (confirm_tx, mut confirm_rx) = mpsc::unbounded_channel();
    let client = Client::builder()
        .uri(broker.uri())
        .publish_confirm_listener(Arc::new(move |_publisher_id, ids: &[u64]| {
            for id in ids {
                let _ = confirm_tx.send(*id);
            }
        }))
        .connect()
        .await
        .unwrap();

    client.declare_stream("s1", &StreamOptions::new()).await.unwrap();
    let producer = client.declare_publisher("s1").await.unwrap();
    assert_eq!(producer.id(), 0);

    let messages: Vec<Bytes> = (0..100)
        .map(|i| Bytes::from(format!("m{i}")))
        .collect();
    let range = producer.batch_publish(&messages).await.unwrap();
    assert_eq!(range, 0..100);

    let mut confirmed = Vec::new();
    while confirmed.len() < 100 {
        confirmed.push(confirm_rx.recv().await.expect("confirm stream ended"));
    }
    confirmed.sort_unstable();
    assert_eq!(confirmed, (0..100).collect::<Vec<u64>>());

    // publishing ids keep climbing across batches
    let range = producer.batch_publish(&messages[..10]).await.unwrap();
    assert_eq!(range, 100..110);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_producer_ids_are_unique_and_reusable() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let first = client.declare_publisher("s1").await.unwrap();
    let second = client.declare_publisher("s1").await.unwrap();
    assert_eq!((first.id(), second.id()), (0, 1));

    first.close().await.unwrap();
    let third = client.declare_publisher("s1").await.unwrap();
    assert_eq!(third.id(), 0, "closed producer's id is reusable");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_get_last_publishing_id() {
    let behavior = BrokerBehavior {
        publisher_sequence: 99,
        ..BrokerBehavior::default()
    };
    let broker = MockBroker::start(behavior).await;
    let client = connect(&broker).await;

    let producer = client.declare_publisher("s1").await.unwrap();
    assert_eq!(producer.get_last_publishing_id().await.unwrap(), 99);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_delivery_credit_and_commit() {
    let behavior = BrokerBehavior {
        deliver_on_subscribe: (0..5).map(|i| Bytes::from(format!("m{i}"))).collect(),
        deliver_first_offset: 0,
        ..BrokerBehavior::default()
    };
    let broker = MockBroker::start(behavior).await;
    let client = connect(&broker).await;

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let consumer = client
        .declare_subscriber(
            "s1",
            Arc::new(move |context, message| {
                let _ = delivered_tx.send((context.consumer.current_offset(), message));
            }),
            ConsumerOptions::new()
                .offset(OffsetSpecification::First)
                .name("sub-1"),
        )
        .await
        .unwrap();
    assert_eq!(consumer.id(), 0);

    // messages arrive in order, offsets climbing from the chunk start
    for expected in 0..5u64 {
        let (offset, message) = delivered_rx.recv().await.unwrap();
        assert_eq!(offset, expected);
        assert_eq!(message, Bytes::from(format!("m{expected}")));
    }
    assert_eq!(consumer.current_offset(), 4);

    // one credit per delivered chunk
    broker.wait_until(|state| !state.credits.is_empty()).await;
    assert_eq!(broker.state().credits[0], (0, 1));

    // commit stores the current offset under the subscription name
    consumer.commit().await.unwrap();
    broker.wait_until(|state| !state.commits.is_empty()).await;
    assert_eq!(
        broker.state().commits[0],
        ("sub-1".to_string(), "s1".to_string(), 4)
    );

    // subscribe frame carried the initial credit of 10
    let mut subscribe = broker.state().first_body(COMMAND_SUBSCRIBE).unwrap();
    subscribe.get_u32(); // correlation id
    subscribe.get_u8(); // subscription id
    let stream_len = subscribe.get_i16() as usize;
    subscribe.advance(stream_len);
    assert_eq!(subscribe.get_i16(), 1); // OffsetSpecification::First
    assert_eq!(subscribe.get_u16(), 10);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_last_consumed_rewrites_to_queried_offset() {
    let behavior = BrokerBehavior {
        stored_offset: 42,
        ..BrokerBehavior::default()
    };
    let broker = MockBroker::start(behavior).await;
    let client = connect(&broker).await;

    let consumer = client
        .declare_subscriber(
            "s1",
            Arc::new(|_context, _message| {}),
            ConsumerOptions::new()
                .offset(OffsetSpecification::LastConsumed)
                .name("sub-1"),
        )
        .await
        .unwrap();

    // QueryOffset went out before Subscribe
    let keys = broker.state().frame_keys();
    let query_position = keys.iter().position(|k| *k == COMMAND_QUERY_OFFSET).unwrap();
    let subscribe_position = keys.iter().position(|k| *k == COMMAND_SUBSCRIBE).unwrap();
    assert!(query_position < subscribe_position);

    // the wire never sees LastConsumed: it reads as Offset(42)
    let mut subscribe = broker.state().first_body(COMMAND_SUBSCRIBE).unwrap();
    subscribe.get_u32(); // correlation id
    subscribe.get_u8(); // subscription id
    let stream_len = subscribe.get_i16() as usize;
    subscribe.advance(stream_len);
    assert_eq!(subscribe.get_i16(), 4); // OffsetSpecification::Offset
    assert_eq!(subscribe.get_u64(), 42);

    assert_eq!(consumer.current_offset(), 42);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_metadata_and_broker_leader() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let metadata = client.metadata(&["s1", "s2"]).await.unwrap();
    assert_eq!(metadata.len(), 2);
    let s1 = metadata.get("s1").unwrap();
    assert_eq!(s1.leader.as_ref().unwrap().host, "node-1");
    assert_eq!(s1.replicas.len(), 1);
    assert_eq!(s1.replicas[0].host, "node-2");

    let leader = client.broker_leader("s1").await.unwrap();
    assert_eq!((leader.host.as_str(), leader.port), ("node-1", 5551));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_broker_leader_surfaces_stream_error_code() {
    let behavior = BrokerBehavior {
        metadata_code: RESPONSE_CODE_STREAM_DOES_NOT_EXIST,
        ..BrokerBehavior::default()
    };
    let broker = MockBroker::start(behavior).await;
    let client = connect(&broker).await;

    let err = client.broker_leader("missing").await.unwrap_err();
    assert!(matches!(
        err,
        StreamError::Broker {
            code: RESPONSE_CODE_STREAM_DOES_NOT_EXIST
        }
    ));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_cascade_ordering() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let _producer_a = client.declare_publisher("s1").await.unwrap();
    let _producer_b = client.declare_publisher("s1").await.unwrap();
    let _consumer = client
        .declare_subscriber(
            "s1",
            Arc::new(|_context, _message| {}),
            ConsumerOptions::new(),
        )
        .await
        .unwrap();

    client.close().await.unwrap();

    let state = broker.state();
    assert_eq!(state.count(COMMAND_DELETE_PUBLISHER), 2);
    assert_eq!(state.count(COMMAND_UNSUBSCRIBE), 1);
    assert_eq!(state.count(COMMAND_CLOSE), 1);

    let keys = state.frame_keys();
    let close_position = keys.iter().position(|k| *k == COMMAND_CLOSE).unwrap();
    for (position, key) in keys.iter().enumerate() {
        if *key == COMMAND_DELETE_PUBLISHER || *key == COMMAND_UNSUBSCRIBE {
            assert!(
                position < close_position,
                "handle deletion after the close frame"
            );
        }
    }

    // the close frame carries code OK under a response-flagged key
    let close = state
        .frames
        .iter()
        .find(|f| f.key == COMMAND_CLOSE)
        .unwrap();
    assert!(close.is_response);
    let mut body = close.body.clone();
    body.get_u32(); // correlation id
    assert_eq!(body.get_u16(), RESPONSE_CODE_OK);
    drop(state);

    // idempotent: no second close frame, no error
    client.close().await.unwrap();
    assert_eq!(broker.state().count(COMMAND_CLOSE), 1);
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_handle_close_after_cascade_sends_no_frame() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let producer = client.declare_publisher("s1").await.unwrap();
    client.close().await.unwrap();
    assert_eq!(broker.state().count(COMMAND_DELETE_PUBLISHER), 1);

    producer.close().await.unwrap();
    assert_eq!(broker.state().count(COMMAND_DELETE_PUBLISHER), 1);
}

#[tokio::test]
async fn test_producer_close_is_idempotent() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;

    let producer = client.declare_publisher("s1").await.unwrap();
    producer.close().await.unwrap();
    producer.close().await.unwrap();
    assert_eq!(broker.state().count(COMMAND_DELETE_PUBLISHER), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_close_return_closed() {
    let broker = MockBroker::start(BrokerBehavior::default()).await;
    let client = connect(&broker).await;
    client.close().await.unwrap();

    assert!(matches!(
        client.declare_stream("s1", &StreamOptions::new()).await,
        Err(StreamError::Closed)
    ));
    assert!(matches!(
        client.declare_publisher("s1").await,
        Err(StreamError::Closed)
    ));
}

// The slow one: a muted broker makes the call ride out the full
// response timeout before the slot is released.
#[tokio::test]
async fn test_unanswered_command_times_out() {
    let mut behavior = BrokerBehavior::default();
    behavior.mute.insert(COMMAND_CREATE_STREAM);
    let broker = MockBroker::start(behavior).await;
    let client = connect(&broker).await;

    let started = std::time::Instant::now();
    let err = client
        .declare_stream("s1", &StreamOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamError::Timeout {
            command: "CreateStream"
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(4));

    // the connection survives a timeout; later commands still work
    client.delete_stream("s-other").await.unwrap_err(); // broker says not found
    client.close().await.unwrap();
}
