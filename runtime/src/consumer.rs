//! Sequential manual-acknowledgment consumer.
//!
//! The consumer pulls one delivery at a time (prefetch 1), decodes it, runs
//! the handler under a processing timeout and only then settles it:
//!
//! | Outcome                        | Settlement             |
//! |--------------------------------|------------------------|
//! | handler succeeded              | ack                    |
//! | handler failed or timed out    | nack, requeue          |
//! | payload is not a valid envelope| nack, no requeue       |
//!
//! Acknowledgment is always the last step, so a crash at any point before it
//! leaves the message on the queue for redelivery (at-least-once). Handlers
//! must therefore tolerate duplicates.

use crate::metrics::ConsumerMetrics;
use courier_core::broker::{BrokerChannel, BrokerError, Delivery, QueueDescriptor};
use courier_core::envelope::{EnvelopeError, EventEnvelope};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default bound on processing one delivery.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default consumer tag announced to the broker.
pub const DEFAULT_CONSUMER_TAG: &str = "courier-consumer";

/// Why a delivery was not acknowledged.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The payload is not a valid envelope. Redelivery cannot fix this.
    #[error("Undecodable delivery: {0}")]
    Decode(#[from] EnvelopeError),

    /// The handler reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The handler did not finish within the processing timeout.
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),
}

impl ProcessingError {
    /// Whether the delivery should go back on the queue.
    #[must_use]
    pub const fn requeue(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

/// Processes decoded envelopes.
///
/// Implemented for any `Fn(EventEnvelope) -> impl Future<Output =
/// Result<(), ProcessingError>>`, so a closure or async fn works as a handler.
pub trait MessageHandler: Send + Sync {
    /// Process one envelope. `Ok` leads to an ack.
    fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessingError>> + Send + '_>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    fn handle(
        &self,
        envelope: EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessingError>> + Send + '_>> {
        Box::pin(self(envelope))
    }
}

/// Settlement counts for one [`EventConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Deliveries acknowledged after successful processing.
    pub acked: u64,
    /// Deliveries rejected with requeue.
    pub requeued: u64,
    /// Deliveries rejected without requeue.
    pub rejected: u64,
}

/// Consumes one queue with manual acknowledgment.
pub struct EventConsumer<H> {
    channel: Arc<dyn BrokerChannel>,
    queue: QueueDescriptor,
    handler: H,
    processing_timeout: Duration,
    consumer_tag: String,
}

impl<H: MessageHandler> EventConsumer<H> {
    /// Consumer for `queue` on `channel` that feeds `handler`.
    #[must_use]
    pub fn new(channel: Arc<dyn BrokerChannel>, queue: QueueDescriptor, handler: H) -> Self {
        Self {
            channel,
            queue,
            handler,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
        }
    }

    /// Set the bound on processing one delivery.
    #[must_use]
    pub const fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Set the consumer tag announced to the broker.
    #[must_use]
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Run until `shutdown` resolves.
    ///
    /// Declares the queue, sets prefetch to 1 and starts consuming. Shutdown
    /// is only observed between deliveries: a delivery already being
    /// processed is finished (or times out) and settled first. The caller
    /// closes the channel afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if setup fails, the delivery stream fails or
    /// ends ([`BrokerError::ChannelClosed`]), or a settlement cannot be sent.
    pub async fn run<S>(&self, shutdown: S) -> Result<ConsumerSummary, BrokerError>
    where
        S: Future<Output = ()>,
    {
        self.channel.declare_queue(&self.queue).await?;
        self.channel.set_prefetch(1).await?;
        let mut deliveries = self
            .channel
            .consume(&self.queue, &self.consumer_tag)
            .await?;

        tracing::info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            timeout_ms = u64::try_from(self.processing_timeout.as_millis()).unwrap_or(u64::MAX),
            "Consumer started"
        );

        tokio::pin!(shutdown);
        let mut summary = ConsumerSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(
                        acked = summary.acked,
                        requeued = summary.requeued,
                        rejected = summary.rejected,
                        "Consumer stopping"
                    );
                    return Ok(summary);
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery, &mut summary).await?,
                Some(Err(error)) => {
                    tracing::error!(queue = %self.queue, error = %error, "Delivery stream failed");
                    return Err(error);
                },
                None => {
                    tracing::error!(queue = %self.queue, "Delivery stream ended");
                    return Err(BrokerError::ChannelClosed(format!(
                        "consumer on queue '{}' was cancelled",
                        self.queue
                    )));
                },
            }
        }
    }

    async fn process(
        &self,
        delivery: Delivery,
        summary: &mut ConsumerSummary,
    ) -> Result<(), BrokerError> {
        let delivery_tag = delivery.delivery_tag;
        let started = Instant::now();

        match self.handle(&delivery.data).await {
            Ok(()) => {
                delivery.ack().await?;
                summary.acked += 1;
                ConsumerMetrics::record_acked(started.elapsed());
                tracing::debug!(delivery_tag, "Delivery acknowledged");
            },
            Err(error) => {
                let requeue = error.requeue();
                tracing::warn!(
                    delivery_tag,
                    redelivered = delivery.redelivered,
                    requeue,
                    error = %error,
                    "Delivery not processed"
                );
                delivery.nack(requeue).await?;
                if requeue {
                    summary.requeued += 1;
                    ConsumerMetrics::record_requeued();
                } else {
                    summary.rejected += 1;
                    ConsumerMetrics::record_rejected();
                }
            },
        }

        Ok(())
    }

    async fn handle(&self, data: &[u8]) -> Result<(), ProcessingError> {
        let envelope = EventEnvelope::from_bytes(data)?;
        tokio::time::timeout(self.processing_timeout, self.handler.handle(envelope))
            .await
            .map_err(|_| ProcessingError::Timeout(self.processing_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_failures_skip_requeue() {
        assert!(!ProcessingError::Decode(EnvelopeError::DeserializationError("x".into())).requeue());
        assert!(ProcessingError::Handler("db down".into()).requeue());
        assert!(ProcessingError::Timeout(Duration::from_secs(1)).requeue());
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |envelope: EventEnvelope| async move {
            match envelope {
                EventEnvelope::HelloCreated { id, .. } if id > 0 => Ok(()),
                EventEnvelope::HelloCreated { .. } => Err(ProcessingError::Handler("bad id".into())),
            }
        };

        let ok = EventEnvelope::HelloCreated {
            id: 1,
            message: "hi".into(),
        };
        let bad = EventEnvelope::HelloCreated {
            id: 0,
            message: "hi".into(),
        };

        assert!(handler.handle(ok).await.is_ok());
        assert!(matches!(
            handler.handle(bad).await,
            Err(ProcessingError::Handler(_))
        ));
    }
}
