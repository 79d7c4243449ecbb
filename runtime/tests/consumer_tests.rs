//! Integration tests for the manual-ack consumer
//!
//! Covers ack-after-processing, redelivery of failed messages, poison
//! messages, processing timeouts, graceful shutdown and the full
//! commit → publish → consume round trip.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use courier_core::broker::{BrokerChannel, BrokerError, Connector, QueueDescriptor};
use courier_core::envelope::EventEnvelope;
use courier_core::record::{HelloRecord, HelloStore};
use courier_runtime::{ConsumerSummary, EventConsumer, EventPublisher, ProcessingError};
use courier_testing::{FakeBroker, InMemoryHelloStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// Test Fixtures
// ============================================================================

const QUEUE: &str = "hello.queue";

fn queue() -> QueueDescriptor {
    QueueDescriptor::durable(QUEUE)
}

fn hello(id: i64, message: &str) -> Vec<u8> {
    EventEnvelope::HelloCreated {
        id,
        message: message.to_string(),
    }
    .to_bytes()
    .unwrap()
}

async fn channel(broker: &FakeBroker) -> Arc<dyn BrokerChannel> {
    broker.connect("amqp://fake").await.unwrap()
}

type Seen = Arc<Mutex<Vec<EventEnvelope>>>;

/// Handler that records every envelope and succeeds.
fn recording_handler(
    seen: &Seen,
) -> impl Fn(EventEnvelope) -> std::future::Ready<Result<(), ProcessingError>> + Send + Sync + 'static
{
    let seen = Arc::clone(seen);
    move |envelope| {
        seen.lock().unwrap().push(envelope);
        std::future::ready(Ok(()))
    }
}

/// Spawn `consumer.run` with a shutdown trigger.
fn spawn<H>(
    consumer: EventConsumer<H>,
) -> (oneshot::Sender<()>, JoinHandle<Result<ConsumerSummary, BrokerError>>)
where
    H: courier_runtime::MessageHandler + 'static,
{
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        consumer
            .run(async {
                let _ = stopped.await;
            })
            .await
    });
    (stop, task)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn acks_after_successful_processing() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, hello(1, "hi"));
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel(&broker).await, queue(), recording_handler(&seen));

    let (stop, task) = spawn(consumer);
    broker.wait_for_settlements(1).await;
    stop.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(
        summary,
        ConsumerSummary {
            acked: 1,
            requeued: 0,
            rejected: 0
        }
    );
    assert_eq!(broker.acked(), vec![hello(1, "hi")]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventEnvelope::HelloCreated {
            id: 1,
            message: "hi".to_string()
        }]
    );
    assert_eq!(broker.prefetch(), Some(1));
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn declares_queue_before_consuming() {
    let broker = FakeBroker::new();
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel(&broker).await, queue(), recording_handler(&seen));

    let (stop, task) = spawn(consumer);
    // Publishing after the consumer declared the queue reaches it.
    let publisher = channel(&broker).await;
    while broker.queue_durability(QUEUE).is_none() {
        tokio::task::yield_now().await;
    }
    publisher
        .publish(&queue(), &hello(2, "late"), courier_core::DeliveryMode::Persistent)
        .await
        .unwrap();
    broker.wait_for_settlements(1).await;
    stop.send(()).unwrap();

    assert_eq!(task.await.unwrap().unwrap().acked, 1);
    assert_eq!(broker.queue_durability(QUEUE), Some(true));
}

#[tokio::test]
async fn failed_message_is_redelivered_and_acked_exactly_once() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, hello(5, "retry me"));
    let calls = Arc::new(AtomicU32::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_envelope: EventEnvelope| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(ProcessingError::Handler("database unavailable".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    };
    let consumer = EventConsumer::new(channel(&broker).await, queue(), handler);

    let (stop, task) = spawn(consumer);
    broker.wait_for_settlements(2).await;
    stop.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.acked, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let nacked = broker.nacked();
    assert_eq!(nacked.len(), 1);
    assert!(nacked[0].requeue);
    assert_eq!(broker.acked(), vec![hello(5, "retry me")]);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn undecodable_payload_is_rejected_without_requeue() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, b"not json".to_vec());
    broker.inject(QUEUE, br#"{"type":"HelloCreated","id":"7","message":"hi"}"#.to_vec());
    broker.inject(QUEUE, hello(7, "fine"));
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel(&broker).await, queue(), recording_handler(&seen));

    let (stop, task) = spawn(consumer);
    broker.wait_for_settlements(3).await;
    stop.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.acked, 1);
    assert!(broker.nacked().iter().all(|nack| !nack.requeue));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_and_is_requeued() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, hello(9, "slow"));
    let calls = Arc::new(AtomicU32::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_envelope: EventEnvelope| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<(), ProcessingError>(())
            }
        }
    };
    let consumer = EventConsumer::new(channel(&broker).await, queue(), handler)
        .with_processing_timeout(Duration::from_secs(1));

    let (stop, task) = spawn(consumer);
    broker.wait_for_settlements(2).await;
    stop.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.acked, 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_message() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, hello(11, "in flight"));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        move |_envelope: EventEnvelope| {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<(), ProcessingError>(())
            }
        }
    };
    let consumer = EventConsumer::new(channel(&broker).await, queue(), handler);

    let (stop, task) = spawn(consumer);
    started.notified().await;
    stop.send(()).unwrap();
    tokio::task::yield_now().await;
    assert!(!task.is_finished());
    assert!(broker.acked().is_empty());

    release.notify_one();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.acked, 1);
    assert_eq!(broker.acked(), vec![hello(11, "in flight")]);
}

#[tokio::test]
async fn shutdown_leaves_unprocessed_messages_queued() {
    let broker = FakeBroker::new();
    let channel = channel(&broker).await;
    let seen = Seen::default();
    let consumer = EventConsumer::new(Arc::clone(&channel), queue(), recording_handler(&seen));

    let (stop, task) = spawn(consumer);
    stop.send(()).unwrap();
    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary, ConsumerSummary::default());

    broker.inject(QUEUE, hello(12, "later"));
    channel.close().await.unwrap();

    assert_eq!(broker.queue_depth(QUEUE), 1);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_consumer_stream_is_an_error() {
    let broker = FakeBroker::new();
    broker.inject(QUEUE, hello(13, "hi"));
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel(&broker).await, queue(), recording_handler(&seen));

    let (_stop, task) = spawn(consumer);
    broker.wait_for_settlements(1).await;
    broker.cancel_consumers();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::ChannelClosed(_)));
}

#[tokio::test]
async fn consume_on_closed_channel_fails_at_startup() {
    let broker = FakeBroker::new();
    let channel = channel(&broker).await;
    channel.close().await.unwrap();
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel, queue(), recording_handler(&seen));

    let err = consumer.run(std::future::pending()).await.unwrap_err();

    assert!(matches!(err, BrokerError::ChannelClosed(_)));
}

#[tokio::test]
async fn committed_record_round_trips_to_consumer() {
    let broker = FakeBroker::new();
    let store = InMemoryHelloStore::new();
    let seen = Seen::default();
    let consumer = EventConsumer::new(channel(&broker).await, queue(), recording_handler(&seen));
    let publisher_channel = channel(&broker).await;
    publisher_channel.declare_queue(&queue()).await.unwrap();
    let publisher = EventPublisher::new(publisher_channel, queue());

    let record = store.insert("hi").await.unwrap();
    let outcome = publisher
        .publish_after_commit(&record, HelloRecord::created_event)
        .await;
    assert!(outcome.is_published());

    let (stop, task) = spawn(consumer);
    broker.wait_for_settlements(1).await;
    stop.send(()).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventEnvelope::HelloCreated {
            id: record.id,
            message: "hi".to_string()
        }]
    );
    assert_eq!(broker.acked().len(), 1);
}
