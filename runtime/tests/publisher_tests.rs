//! Integration tests for commit-then-publish
//!
//! The store of record is `InMemoryHelloStore`, the broker is `FakeBroker`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::broker::{BrokerError, Connector, DeliveryMode, QueueDescriptor};
use courier_core::envelope::EventEnvelope;
use courier_core::record::{HelloRecord, HelloStore};
use courier_runtime::{EventPublisher, PublishError, PublishOutcome, publish_after_commit};
use courier_testing::{FakeBroker, InMemoryHelloStore, committed_record};
use std::time::Duration;

fn queue() -> QueueDescriptor {
    QueueDescriptor::durable("hello.queue")
}

async fn publisher(broker: &FakeBroker) -> EventPublisher {
    let channel = broker.connect("amqp://fake").await.unwrap();
    channel.declare_queue(&queue()).await.unwrap();
    EventPublisher::new(channel, queue())
}

#[tokio::test]
async fn publishes_committed_record_as_persistent_json() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker).await;

    let outcome = publisher
        .publish_after_commit(&committed_record(7, "hi"), HelloRecord::created_event)
        .await;

    assert!(outcome.is_published());
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "hello.queue");
    assert_eq!(published[0].mode, DeliveryMode::Persistent);
    assert_eq!(
        published[0].payload,
        br#"{"type":"HelloCreated","id":7,"message":"hi"}"#
    );
    assert_eq!(broker.queue_depth("hello.queue"), 1);
}

#[tokio::test]
async fn published_id_is_the_committed_id() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker).await;
    let store = InMemoryHelloStore::new();
    store.insert("first").await.unwrap();

    let record = store.insert("second").await.unwrap();
    let outcome = publisher
        .publish_after_commit(&record, HelloRecord::created_event)
        .await;

    let PublishOutcome::Published { envelope } = outcome else {
        panic!("expected Published, got {outcome:?}");
    };
    let EventEnvelope::HelloCreated { id, message } =
        EventEnvelope::from_bytes(&broker.published()[0].payload).unwrap();
    assert_eq!(envelope, EventEnvelope::HelloCreated { id, message: message.clone() });
    assert_eq!(id, 2);
    let stored = store.records().into_iter().find(|r| r.id == id).unwrap();
    assert_eq!(stored.message, message);
}

#[tokio::test]
async fn disabled_publisher_skips_and_touches_nothing() {
    let broker = FakeBroker::new();
    let publisher = EventPublisher::disabled(queue());

    let outcome = publisher
        .publish_after_commit(&committed_record(1, "hi"), HelloRecord::created_event)
        .await;

    assert!(outcome.is_skipped());
    assert!(!publisher.is_enabled());
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn free_function_without_channel_skips() {
    let outcome = publish_after_commit(
        &committed_record(1, "hi"),
        HelloRecord::created_event,
        None,
        &queue(),
        Duration::from_secs(5),
    )
    .await;

    assert!(matches!(outcome, PublishOutcome::Skipped));
}

#[tokio::test]
async fn broker_rejection_is_reported_not_raised() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker).await;
    broker.fail_publishes(BrokerError::PublishRejected {
        queue: "hello.queue".to_string(),
    });

    let outcome = publisher
        .publish_after_commit(&committed_record(3, "hi"), HelloRecord::created_event)
        .await;

    assert!(matches!(
        outcome.error(),
        Some(PublishError::Broker(BrokerError::PublishRejected { .. }))
    ));
    assert_eq!(broker.queue_depth("hello.queue"), 0);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_publish_times_out() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker)
        .await
        .with_timeout(Duration::from_millis(250));
    broker.stall_publishes();
    let started = tokio::time::Instant::now();

    let outcome = publisher
        .publish_after_commit(&committed_record(3, "hi"), HelloRecord::created_event)
        .await;

    assert!(matches!(
        outcome.error(),
        Some(PublishError::Timeout(timeout)) if *timeout == Duration::from_millis(250)
    ));
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn publish_on_closed_channel_fails() {
    let broker = FakeBroker::new();
    let channel = broker.connect("amqp://fake").await.unwrap();
    channel.declare_queue(&queue()).await.unwrap();
    let publisher = EventPublisher::new(channel.clone(), queue());
    channel.close().await.unwrap();

    let outcome = publisher
        .publish_after_commit(&committed_record(4, "hi"), HelloRecord::created_event)
        .await;

    assert!(matches!(
        outcome.error(),
        Some(PublishError::Broker(BrokerError::ChannelClosed(_)))
    ));
}

#[tokio::test]
async fn failed_publish_is_not_retried() {
    let broker = FakeBroker::new();
    let publisher = publisher(&broker).await;
    broker.fail_publishes(BrokerError::PublishFailed {
        queue: "hello.queue".to_string(),
        reason: "connection reset".to_string(),
    });

    let outcome = publisher
        .publish_after_commit(&committed_record(5, "hi"), HelloRecord::created_event)
        .await;
    broker.accept_publishes();

    assert!(!outcome.is_published());
    assert_eq!(broker.publish_attempts(), 1);
    assert!(broker.published().is_empty());
    assert_eq!(broker.queue_depth("hello.queue"), 0);
}
