//! # Courier Core
//!
//! Core traits and types for the Courier commit-then-publish event pipeline.
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace. It performs no I/O of its own: brokers, stores and timers are
//! described as traits here and implemented by adapter crates
//! (`courier-amqp`, `courier-postgres`) or by fakes (`courier-testing`).
//!
//! ## Core Concepts
//!
//! - **Envelope**: the JSON wire representation of a business event
//!   ([`envelope::EventEnvelope`])
//! - **Broker**: a durable, ack-based queueing service reached through a
//!   [`broker::Connector`] that yields a [`broker::BrokerChannel`]
//! - **Store of record**: the database that commits a fact before anything is
//!   published about it ([`record::HelloStore`])
//! - **Committed**: a record the store has durably committed
//!   ([`record::Committed`]); the only input the publisher accepts
//! - **Environment**: injected dependencies such as [`environment::Sleeper`]
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐   insert + commit   ┌──────────────┐
//! │   Request    │ ──────────────────► │ Store (SQL)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │            Committed<Record>       │
//!        │ ◄──────────────────────────────────┘
//!        ▼
//! ┌──────────────┐  persistent publish ┌──────────────┐  manual ack ┌──────────┐
//! │  Publisher   │ ──────────────────► │ Durable queue│ ──────────► │ Consumer │
//! └──────────────┘                     └──────────────┘             └──────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod envelope;
pub mod record;

// Re-export commonly used types
pub use broker::{BrokerChannel, BrokerError, Connector, Delivery, DeliveryMode, QueueDescriptor};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use record::{Committed, HelloRecord, HelloStore, StoreError};

/// Environment module - Dependency injection traits
///
/// All timing dependencies are abstracted behind traits and injected so the
/// connect loop can be driven through many failures without real delays.
pub mod environment {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Sleeper trait - abstracts waiting for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - suspends on the tokio timer
    /// let sleeper = TokioSleeper;
    /// sleeper.sleep(Duration::from_secs(2)).await;
    ///
    /// // Test - records the requested duration and returns immediately
    /// let sleeper = RecordingSleeper::new();
    /// sleeper.sleep(Duration::from_secs(2)).await;
    /// assert_eq!(sleeper.recorded(), vec![Duration::from_secs(2)]);
    /// ```
    pub trait Sleeper: Send + Sync {
        /// Suspend the caller for `duration`.
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    }

    /// Sleeper backed by [`tokio::time::sleep`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioSleeper;

    impl Sleeper for TokioSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(tokio::time::sleep(duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Sleeper, TokioSleeper};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_advances_virtual_time() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(3)).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
