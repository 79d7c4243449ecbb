//! Commit-then-publish orchestration.
//!
//! The caller has already written and committed a record to the store of
//! record. The publisher turns that committed record into an
//! [`EventEnvelope`], serializes it, and makes exactly one persistent publish
//! to the queue.
//!
//! # Delivery Semantics
//!
//! ```text
//! ┌─────────────────┐
//! │ 1. Commit write │◄─── Source of truth (already done by the caller)
//! └────────┬────────┘
//!          │ Committed<T>
//!          ▼
//! ┌─────────────────┐
//! │ 2. Build + send │◄─── One attempt, bounded by a timeout
//! └────────┬────────┘
//!          │
//!     ┌────┼─────────────┐
//!     ▼    ▼             ▼
//! Published Skipped   Failed
//! ```
//!
//! - The envelope is built only from a [`Committed`] value, so a rollback can
//!   never invalidate a published fact.
//! - No channel (broker disabled) means [`PublishOutcome::Skipped`]: no I/O,
//!   no error.
//! - A transport error, broker rejection or timeout yields
//!   [`PublishOutcome::Failed`]. The committed write is not rolled back and
//!   the publish is not retried. A crash or failure between commit and publish
//!   loses the notification, never the record.

use crate::metrics::PublishMetrics;
use courier_core::broker::{BrokerChannel, BrokerError, DeliveryMode, QueueDescriptor};
use courier_core::envelope::{EnvelopeError, EventEnvelope};
use courier_core::record::Committed;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bound on one publish round-trip.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a publish did not reach the broker.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The envelope could not be serialized.
    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] EnvelopeError),

    /// The broker call failed or the broker refused the message.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker did not confirm within the publish timeout.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of [`publish_after_commit`].
///
/// Never an `Err`: the caller's write already succeeded, and the notification
/// outcome is reported for logging and tests only.
#[must_use]
#[derive(Debug)]
pub enum PublishOutcome {
    /// The broker durably accepted the message.
    Published {
        /// The envelope that was published.
        envelope: EventEnvelope,
    },
    /// No channel was available; nothing was attempted.
    Skipped,
    /// The single publish attempt failed.
    Failed(PublishError),
}

impl PublishOutcome {
    /// Whether the broker accepted the message.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    /// Whether publication was skipped.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The failure, if the publish failed.
    #[must_use]
    pub const fn error(&self) -> Option<&PublishError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Publish the event describing a committed record.
///
/// `envelope_builder` derives the envelope from the committed record; it is
/// not called when `channel` is `None`.
pub async fn publish_after_commit<T, B>(
    committed: &Committed<T>,
    envelope_builder: B,
    channel: Option<&dyn BrokerChannel>,
    queue: &QueueDescriptor,
    timeout: Duration,
) -> PublishOutcome
where
    B: FnOnce(&Committed<T>) -> EventEnvelope,
{
    let Some(channel) = channel else {
        tracing::debug!(queue = %queue, "Broker disabled, skipping publish");
        PublishMetrics::record_skipped();
        return PublishOutcome::Skipped;
    };

    let envelope = envelope_builder(committed);
    let event_type = envelope.event_type();

    let payload = match envelope.to_bytes() {
        Ok(payload) => payload,
        Err(error) => {
            tracing::error!(
                queue = %queue,
                event_type,
                error = %error,
                "Failed to encode envelope"
            );
            PublishMetrics::record_failed();
            return PublishOutcome::Failed(error.into());
        },
    };

    let started = Instant::now();
    let result = tokio::time::timeout(
        timeout,
        channel.publish(queue, &payload, DeliveryMode::Persistent),
    )
    .await;

    let error = match result {
        Ok(Ok(())) => {
            tracing::debug!(
                queue = %queue,
                event_type,
                bytes = payload.len(),
                "Event published"
            );
            PublishMetrics::record_published(event_type, started.elapsed());
            return PublishOutcome::Published { envelope };
        },
        Ok(Err(error)) => PublishError::Broker(error),
        Err(_) => PublishError::Timeout(timeout),
    };

    tracing::warn!(
        queue = %queue,
        event_type,
        error = %error,
        "Failed to publish event; committed record kept, notification lost"
    );
    PublishMetrics::record_failed();
    PublishOutcome::Failed(error)
}

/// Publisher bound to one channel and queue.
///
/// Cheap to share behind an `Arc`; every request handler calls
/// [`publish_after_commit`](Self::publish_after_commit) on the same instance.
#[derive(Clone)]
pub struct EventPublisher {
    channel: Option<Arc<dyn BrokerChannel>>,
    queue: QueueDescriptor,
    timeout: Duration,
}

impl EventPublisher {
    /// Publisher that sends through `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>, queue: QueueDescriptor) -> Self {
        Self {
            channel: Some(channel),
            queue,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Publisher for a deployment without a broker. Every publish is skipped.
    #[must_use]
    pub const fn disabled(queue: QueueDescriptor) -> Self {
        Self {
            channel: None,
            queue,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Set the bound on one publish round-trip.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a channel is attached.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// The target queue.
    #[must_use]
    pub const fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    /// Publish the event for `committed`; see [`publish_after_commit`].
    pub async fn publish_after_commit<T, B>(
        &self,
        committed: &Committed<T>,
        envelope_builder: B,
    ) -> PublishOutcome
    where
        B: FnOnce(&Committed<T>) -> EventEnvelope,
    {
        publish_after_commit(
            committed,
            envelope_builder,
            self.channel.as_deref(),
            &self.queue,
            self.timeout,
        )
        .await
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("enabled", &self.is_enabled())
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_publisher_skips_without_building_envelope() {
        let publisher = EventPublisher::disabled(QueueDescriptor::durable("q"));
        let committed = Committed::assume_committed(1_i64);

        let outcome = publisher
            .publish_after_commit(&committed, |_| unreachable!("builder must not run"))
            .await;

        assert!(outcome.is_skipped());
        assert!(outcome.error().is_none());
    }

    #[test]
    fn publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<EventPublisher>();
        assert_sync::<EventPublisher>();
    }
}
