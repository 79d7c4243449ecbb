//! Broker abstraction for durable, ack-based message queueing.
//!
//! This module describes the broker the pipeline talks to in terms of AMQP
//! 0-9-1 semantics: named durable queues, persistent delivery mode, manual
//! consumer acknowledgment, and direct routing by queue name through the
//! default exchange.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  connect(url)  ┌──────────────────┐
//! │  Connector  │ ─────────────► │  BrokerChannel   │ (owns its connection)
//! └─────────────┘                └────────┬─────────┘
//!                                         │
//!                    ┌────────────────────┼────────────────────┐
//!                    ▼                    ▼                    ▼
//!              declare_queue           publish              consume
//!                                                              │
//!                                                              ▼
//!                                                     Delivery ─► ack / nack
//! ```
//!
//! # Implementations
//!
//! - `AmqpConnector` in `courier-amqp` - RabbitMQ via lapin
//! - `FakeBroker` in `courier-testing` - in-memory, scriptable failures
//!
//! # Dyn Compatibility
//!
//! Traits return `Pin<Box<dyn Future>>` instead of using `async fn` so that
//! channels can be shared as `Arc<dyn BrokerChannel>` between the connection
//! manager, the publisher and the consumer.

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// The broker could not be reached (refused, unreachable, reset, not ready).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker refused our credentials or virtual host.
    #[error("Access refused: {0}")]
    AccessRefused(String),

    /// The connection string could not be parsed.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// The channel or its connection is no longer open.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Declaring a queue failed, typically because an existing queue was
    /// declared with different durability.
    #[error("Declare failed for queue '{queue}': {reason}")]
    DeclareFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// A publish call failed in transport.
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker negatively confirmed a publish.
    #[error("Publish to queue '{queue}' was not confirmed by the broker")]
    PublishRejected {
        /// The queue that rejected the message
        queue: String,
    },

    /// Starting a consumer failed.
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgment failed for delivery {delivery_tag}: {reason}")]
    AckFailed {
        /// The delivery tag that could not be settled
        delivery_tag: u64,
        /// The reason for failure
        reason: String,
    },

    /// Generic error for other failures
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only reachability problems are transient. Credential, URL and
    /// declaration mismatches fail the same way on every attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::ChannelClosed(_))
    }
}

/// Identifies the target queue of a publisher or consumer.
///
/// Publisher and consumer must declare the queue with the same durability;
/// brokers reject a redeclaration that disagrees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDescriptor {
    /// Queue name, also used as routing key on the default exchange.
    pub name: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
}

impl QueueDescriptor {
    /// A durable queue with the given name.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

impl fmt::Display for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Delivery mode attribute of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Message may be lost if the broker restarts.
    Transient,
    /// Broker persists the message before confirming it.
    Persistent,
}

impl DeliveryMode {
    /// The AMQP `delivery-mode` property value.
    #[must_use]
    pub const fn as_amqp(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// Settles a single delivery with the broker.
///
/// Implementations are created by the channel that produced the delivery and
/// are consumed exactly once through [`Delivery::ack`] or [`Delivery::nack`].
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge the delivery.
    fn ack(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Negatively acknowledge the delivery.
    ///
    /// With `requeue` the broker redelivers it; without, the broker drops or
    /// dead-letters it according to its own policy.
    fn nack(
        &self,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

/// A message pulled from a queue, awaiting acknowledgment.
///
/// `ack` and `nack` take `self`, so a delivery can be settled at most once.
/// Dropping a delivery without settling it leaves it unacknowledged; the
/// broker redelivers it when the channel closes.
pub struct Delivery {
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Raw message body.
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the channel could not deliver the
    /// acknowledgment; the broker will then redeliver the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery, optionally asking for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the channel could not deliver the
    /// rejection.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// An open channel to the broker.
///
/// A channel owns the connection it was opened on; closing the channel
/// releases both.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Concurrent `publish` calls from
/// several request handlers are allowed; implementations that cannot publish
/// concurrently must serialize internally.
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] if the broker rejects the
    /// declaration, e.g. a durability mismatch with an existing queue.
    fn declare_queue(
        &self,
        queue: &QueueDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Publish `payload` to `queue` through the default exchange.
    ///
    /// Resolves once the broker has accepted the message. For
    /// [`DeliveryMode::Persistent`] that means it has been written to stable
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] on transport failure and
    /// [`BrokerError::PublishRejected`] if the broker refuses the message.
    fn publish(
        &self,
        queue: &QueueDescriptor,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Limit the number of unacknowledged deliveries in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed.
    fn set_prefetch(
        &self,
        count: u16,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Start a manual-acknowledgment consumer on `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the consumer cannot start.
    fn consume(
        &self,
        queue: &QueueDescriptor,
        consumer_tag: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;

    /// Close the channel and its connection.
    ///
    /// Closing an already closed channel succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker did not acknowledge the close; the
    /// connection is dropped regardless.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;
}

impl fmt::Debug for dyn BrokerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BrokerChannel")
    }
}

/// Opens channels to a broker.
pub trait Connector: Send + Sync {
    /// Connect to `url` and open one channel on the new connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] when the broker is
    /// unreachable, [`BrokerError::AccessRefused`] or
    /// [`BrokerError::InvalidUrl`] for permanent failures.
    fn connect(
        &self,
        url: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrokerChannel>, BrokerError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    struct NullChannel;

    impl BrokerChannel for NullChannel {
        fn declare_queue(
            &self,
            _queue: &QueueDescriptor,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn publish(
            &self,
            _queue: &QueueDescriptor,
            _payload: &[u8],
            _mode: DeliveryMode,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn set_prefetch(
            &self,
            _count: u16,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn consume(
            &self,
            _queue: &QueueDescriptor,
            _consumer_tag: &str,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(Box::pin(futures::stream::empty()) as DeliveryStream) })
        }

        fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn channel_handles_are_debuggable() {
        let result: Result<Arc<dyn BrokerChannel>, BrokerError> = Ok(Arc::new(NullChannel));
        assert_eq!(format!("{result:?}"), "Ok(BrokerChannel)");

        let failed: Result<Arc<dyn BrokerChannel>, BrokerError> =
            Err(BrokerError::ConnectionFailed("refused".into()));
        assert!(matches!(failed.unwrap_err(), BrokerError::ConnectionFailed(_)));
    }

    #[test]
    fn only_reachability_errors_are_transient() {
        assert!(BrokerError::ConnectionFailed("refused".into()).is_transient());
        assert!(BrokerError::ChannelClosed("reset".into()).is_transient());
        assert!(!BrokerError::AccessRefused("guest".into()).is_transient());
        assert!(!BrokerError::InvalidUrl("nope".into()).is_transient());
        assert!(
            !BrokerError::DeclareFailed {
                queue: "q".into(),
                reason: "PRECONDITION_FAILED".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn persistent_maps_to_amqp_mode_two() {
        assert_eq!(DeliveryMode::Persistent.as_amqp(), 2);
        assert_eq!(DeliveryMode::Transient.as_amqp(), 1);
    }

    #[test]
    fn durable_descriptor() {
        let queue = QueueDescriptor::durable("hello.queue");
        assert!(queue.durable);
        assert_eq!(queue.to_string(), "hello.queue");
    }

    #[test]
    fn channel_traits_are_dyn_compatible() {
        fn assert_dyn(_: Option<&dyn BrokerChannel>, _: Option<&dyn Connector>) {}
        assert_dyn(None, None);
    }
}
