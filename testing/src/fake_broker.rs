//! In-memory broker for fast, deterministic pipeline tests.
//!
//! [`FakeBroker`] implements [`Connector`] and hands out channels backed by a
//! shared in-memory model of a broker:
//!
//! - durable/non-durable queues with redeclaration checks
//! - publish through the default exchange (unroutable messages are dropped)
//! - manual-ack consumers that honour the channel prefetch
//! - nack with requeue puts the message back at the head, flagged redelivered
//! - closing a channel returns its unacknowledged deliveries to the queue
//!
//! Failures are scripted up front: refused connects, access errors, declare
//! failures, publish failures and publishes that never complete.

use async_stream::stream;
use courier_core::broker::{
    Acknowledger, BrokerChannel, BrokerError, Connector, Delivery, DeliveryMode, DeliveryStream,
    QueueDescriptor,
};
use futures::future;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

/// A message accepted by a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Routing key (queue name).
    pub queue: String,
    /// Message body.
    pub payload: Vec<u8>,
    /// Delivery mode requested by the publisher.
    pub mode: DeliveryMode,
}

/// A negative acknowledgment observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackedMessage {
    /// Message body.
    pub payload: Vec<u8>,
    /// Whether the consumer asked for redelivery.
    pub requeue: bool,
}

#[derive(Debug, Clone)]
enum PublishBehaviour {
    Accept,
    Fail(BrokerError),
    Stall,
}

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel_id: u64,
    prefetch: Option<u16>,
    tx: DeliverySender,
}

struct Queue {
    durable: bool,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, (u64, Message)>,
    consumer: Option<Consumer>,
}

impl Queue {
    const fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumer: None,
        }
    }
}

struct BrokerState {
    scripted_connect_failures: VecDeque<BrokerError>,
    connect_failure: Option<BrokerError>,
    declare_failures: u32,
    publish_behaviour: PublishBehaviour,
    publish_attempts: u64,
    connect_attempts: u32,
    channels_opened: u64,
    channels_closed: u64,
    next_delivery_tag: u64,
    prefetch: HashMap<u64, u16>,
    queues: HashMap<String, Queue>,
    published: Vec<PublishedMessage>,
    acked: Vec<Vec<u8>>,
    nacked: Vec<NackedMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            scripted_connect_failures: VecDeque::new(),
            connect_failure: None,
            declare_failures: 0,
            publish_behaviour: PublishBehaviour::Accept,
            publish_attempts: 0,
            connect_attempts: 0,
            channels_opened: 0,
            channels_closed: 0,
            next_delivery_tag: 0,
            prefetch: HashMap::new(),
            queues: HashMap::new(),
            published: Vec::new(),
            acked: Vec::new(),
            nacked: Vec::new(),
        }
    }
}

/// Scriptable in-memory broker.
///
/// Cloning yields another handle to the same broker, so a test can keep one
/// handle for inspection while the code under test connects through another.
///
/// # Example
///
/// ```
/// use courier_testing::FakeBroker;
/// use courier_core::broker::Connector;
///
/// # async fn example() {
/// let broker = FakeBroker::new();
/// broker.fail_connects(2);
///
/// assert!(broker.connect("amqp://fake").await.is_err());
/// assert!(broker.connect("amqp://fake").await.is_err());
/// assert!(broker.connect("amqp://fake").await.is_ok());
/// assert_eq!(broker.connect_attempts(), 3);
/// # }
/// ```
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    settlements: Arc<watch::Sender<usize>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    /// Create a reachable broker with no queues.
    #[must_use]
    pub fn new() -> Self {
        let (settlements, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            settlements: Arc::new(settlements),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Scripting

    /// Refuse the next `n` connects with a transient connection error.
    pub fn fail_connects(&self, n: u32) {
        let mut state = self.lock();
        for _ in 0..n {
            state
                .scripted_connect_failures
                .push_back(BrokerError::ConnectionFailed("connection refused".to_string()));
        }
    }

    /// Refuse every connect with a transient connection error.
    pub fn unreachable(&self) {
        self.lock().connect_failure = Some(BrokerError::ConnectionFailed(
            "no route to host".to_string(),
        ));
    }

    /// Refuse every connect with an authentication error.
    pub fn refuse_access(&self) {
        self.lock().connect_failure = Some(BrokerError::AccessRefused(
            "ACCESS_REFUSED - login refused".to_string(),
        ));
    }

    /// Clear [`unreachable`](Self::unreachable) and
    /// [`refuse_access`](Self::refuse_access).
    pub fn recover(&self) {
        self.lock().connect_failure = None;
    }

    /// Drop the connection during the next `n` queue declarations.
    pub fn fail_declares(&self, n: u32) {
        self.lock().declare_failures = n;
    }

    /// Fail every publish with `error`.
    pub fn fail_publishes(&self, error: BrokerError) {
        self.lock().publish_behaviour = PublishBehaviour::Fail(error);
    }

    /// Make every publish wait forever for its confirmation.
    pub fn stall_publishes(&self) {
        self.lock().publish_behaviour = PublishBehaviour::Stall;
    }

    /// Accept publishes again.
    pub fn accept_publishes(&self) {
        self.lock().publish_behaviour = PublishBehaviour::Accept;
    }

    /// Place a raw message on `queue` as if another publisher had sent it.
    ///
    /// The queue is created (durable) if it does not exist yet.
    pub fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Queue::new(true))
            .ready
            .push_back(Message {
                data: payload.into(),
                redelivered: false,
            });
        self.dispatch(state, queue);
    }

    /// End every consumer stream, as a broker does when it cancels
    /// consumers. Unacknowledged deliveries return to their queues.
    pub fn cancel_consumers(&self) {
        let mut guard = self.lock();
        for queue in guard.queues.values_mut() {
            queue.consumer = None;
            requeue_unacked(queue, |_| true);
        }
    }

    // Inspection

    /// Number of connect calls, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Number of channels handed out.
    #[must_use]
    pub fn channels_opened(&self) -> u64 {
        self.lock().channels_opened
    }

    /// Number of channels closed (each counted once).
    #[must_use]
    pub fn channels_closed(&self) -> u64 {
        self.lock().channels_closed
    }

    /// Every message accepted by a publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Number of `publish` calls made on any channel, including ones that
    /// failed or stalled.
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        self.lock().publish_attempts
    }

    /// Bodies of acknowledged deliveries, in order.
    #[must_use]
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    /// Negative acknowledgments, in order.
    #[must_use]
    pub fn nacked(&self) -> Vec<NackedMessage> {
        self.lock().nacked.clone()
    }

    /// Messages waiting on `queue`, excluding unacknowledged deliveries.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries on `queue` handed to a consumer and not yet settled.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Whether `queue` has been declared, and with which durability.
    #[must_use]
    pub fn queue_durability(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Prefetch limit most recently set on any channel.
    #[must_use]
    pub fn prefetch(&self) -> Option<u16> {
        let state = self.lock();
        state
            .prefetch
            .iter()
            .max_by_key(|(channel, _)| **channel)
            .map(|(_, count)| *count)
    }

    /// Wait until `n` deliveries in total have been acked or nacked.
    pub async fn wait_for_settlements(&self, n: usize) {
        let mut rx = self.settlements.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|settled| *settled >= n).await;
    }

    // Broker model

    fn open_channel(&self) -> Result<FakeChannel, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if let Some(error) = state.scripted_connect_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.connect_failure.clone() {
            return Err(error);
        }

        state.channels_opened += 1;
        Ok(FakeChannel {
            id: state.channels_opened,
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn declare(&self, queue: &QueueDescriptor) -> Result<(), BrokerError> {
        let mut state = self.lock();

        if state.declare_failures > 0 {
            state.declare_failures -= 1;
            return Err(BrokerError::ChannelClosed(
                "connection reset during queue declare".to_string(),
            ));
        }

        match state.queues.get(&queue.name) {
            Some(existing) if existing.durable != queue.durable => {
                Err(BrokerError::DeclareFailed {
                    queue: queue.name.clone(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable': received '{}' but current is '{}'",
                        queue.durable, existing.durable
                    ),
                })
            },
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), Queue::new(queue.durable));
                Ok(())
            },
        }
    }

    fn accept(&self, queue: &QueueDescriptor, payload: Vec<u8>, mode: DeliveryMode) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.published.push(PublishedMessage {
            queue: queue.name.clone(),
            payload: payload.clone(),
            mode,
        });

        // The default exchange drops messages for queues that do not exist.
        if let Some(target) = state.queues.get_mut(&queue.name) {
            target.ready.push_back(Message {
                data: payload,
                redelivered: false,
            });
            self.dispatch(state, &queue.name);
        }
    }

    fn register_consumer(
        &self,
        channel_id: u64,
        queue: &QueueDescriptor,
    ) -> Result<mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>, BrokerError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let prefetch = state.prefetch.get(&channel_id).copied();

        let Some(target) = state.queues.get_mut(&queue.name) else {
            return Err(BrokerError::ConsumeFailed {
                queue: queue.name.clone(),
                reason: format!("NOT_FOUND - no queue '{}'", queue.name),
            });
        };
        if target.consumer.as_ref().is_some_and(|c| !c.tx.is_closed()) {
            return Err(BrokerError::ConsumeFailed {
                queue: queue.name.clone(),
                reason: "queue already has an active consumer".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        target.consumer = Some(Consumer {
            channel_id,
            prefetch,
            tx,
        });
        self.dispatch(state, &queue.name);
        Ok(rx)
    }

    fn close_channel(&self, channel_id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.channels_closed += 1;
        state.prefetch.remove(&channel_id);

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            if let Some(queue) = state.queues.get_mut(&name) {
                if queue
                    .consumer
                    .as_ref()
                    .is_some_and(|c| c.channel_id == channel_id)
                {
                    queue.consumer = None;
                }
                requeue_unacked(queue, |owner| owner == channel_id);
            }
            self.dispatch(state, &name);
        }
    }

    fn settle(&self, queue: &str, delivery_tag: u64, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some((_, message)) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&delivery_tag))
        else {
            return Err(BrokerError::AckFailed {
                delivery_tag,
                reason: "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            });
        };

        match requeue {
            None => state.acked.push(message.data),
            Some(requeue) => {
                state.nacked.push(NackedMessage {
                    payload: message.data.clone(),
                    requeue,
                });
                if requeue {
                    if let Some(target) = state.queues.get_mut(queue) {
                        target.ready.push_front(Message {
                            data: message.data,
                            redelivered: true,
                        });
                    }
                }
            },
        }

        self.dispatch(state, queue);
        drop(guard);
        self.settlements.send_modify(|settled| *settled += 1);
        Ok(())
    }

    /// Hand ready messages to the queue's consumer while its prefetch allows.
    fn dispatch(&self, state: &mut BrokerState, queue: &str) {
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        loop {
            let Some(consumer) = target.consumer.as_ref() else {
                return;
            };
            if consumer
                .prefetch
                .is_some_and(|limit| limit > 0 && target.unacked.len() >= usize::from(limit))
            {
                return;
            }
            let Some(message) = target.ready.pop_front() else {
                return;
            };

            state.next_delivery_tag += 1;
            let delivery_tag = state.next_delivery_tag;
            let delivery = Delivery::new(
                delivery_tag,
                message.redelivered,
                message.data.clone(),
                Box::new(FakeAcker {
                    state: Arc::downgrade(&self.state),
                    settlements: Arc::clone(&self.settlements),
                    queue: queue.to_string(),
                    delivery_tag,
                }),
            );

            let channel_id = consumer.channel_id;
            if consumer.tx.send(Ok(delivery)).is_ok() {
                target.unacked.insert(delivery_tag, (channel_id, message));
            } else {
                target.ready.push_front(message);
                target.consumer = None;
            }
        }
    }
}

fn requeue_unacked(queue: &mut Queue, owned_by: impl Fn(u64) -> bool) {
    let tags: Vec<u64> = queue
        .unacked
        .iter()
        .filter(|(_, (owner, _))| owned_by(*owner))
        .map(|(tag, _)| *tag)
        .collect();

    // Highest tag first so the oldest delivery ends up at the head.
    for tag in tags.into_iter().rev() {
        if let Some((_, message)) = queue.unacked.remove(&tag) {
            queue.ready.push_front(Message {
                data: message.data,
                redelivered: true,
            });
        }
    }
}

impl Connector for FakeBroker {
    fn connect(&self, _url: &str) -> BoxFuture<'_, Result<Arc<dyn BrokerChannel>, BrokerError>> {
        let result = self
            .open_channel()
            .map(|channel| Arc::new(channel) as Arc<dyn BrokerChannel>);
        Box::pin(future::ready(result))
    }
}

/// Channel handed out by [`FakeBroker`].
struct FakeChannel {
    id: u64,
    broker: FakeBroker,
    closed: AtomicBool,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed("channel was closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl BrokerChannel for FakeChannel {
    fn declare_queue(&self, queue: &QueueDescriptor) -> BoxFuture<'_, Result<(), BrokerError>> {
        let result = self.ensure_open().and_then(|()| self.broker.declare(queue));
        Box::pin(future::ready(result))
    }

    fn publish(
        &self,
        queue: &QueueDescriptor,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> BoxFuture<'_, Result<(), BrokerError>> {
        let queue = queue.clone();
        let payload = payload.to_vec();
        Box::pin(async move {
            self.broker.lock().publish_attempts += 1;
            self.ensure_open()?;
            let behaviour = self.broker.lock().publish_behaviour.clone();
            match behaviour {
                PublishBehaviour::Accept => {
                    self.broker.accept(&queue, payload, mode);
                    Ok(())
                },
                PublishBehaviour::Fail(error) => Err(error),
                PublishBehaviour::Stall => future::pending().await,
            }
        })
    }

    fn set_prefetch(&self, count: u16) -> BoxFuture<'_, Result<(), BrokerError>> {
        let result = self.ensure_open().map(|()| {
            self.broker.lock().prefetch.insert(self.id, count);
        });
        Box::pin(future::ready(result))
    }

    fn consume(
        &self,
        queue: &QueueDescriptor,
        _consumer_tag: &str,
    ) -> BoxFuture<'_, Result<DeliveryStream, BrokerError>> {
        let result = self
            .ensure_open()
            .and_then(|()| self.broker.register_consumer(self.id, queue))
            .map(|mut rx| {
                let deliveries = stream! {
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                };
                Box::pin(deliveries) as DeliveryStream
            });
        Box::pin(future::ready(result))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.close_channel(self.id);
        }
        Box::pin(future::ready(Ok(())))
    }
}

/// Settles one delivery against the broker that produced it.
struct FakeAcker {
    state: Weak<Mutex<BrokerState>>,
    settlements: Arc<watch::Sender<usize>>,
    queue: String,
    delivery_tag: u64,
}

impl FakeAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let Some(state) = self.state.upgrade() else {
            return Err(BrokerError::AckFailed {
                delivery_tag: self.delivery_tag,
                reason: "broker is gone".to_string(),
            });
        };
        let broker = FakeBroker {
            state,
            settlements: Arc::clone(&self.settlements),
        };
        broker.settle(&self.queue, self.delivery_tag, requeue)
    }
}

impl Acknowledger for FakeAcker {
    fn ack(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(future::ready(self.settle(None)))
    }

    fn nack(&self, requeue: bool) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(future::ready(self.settle(Some(requeue))))
    }
}
