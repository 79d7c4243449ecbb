//! # Courier Runtime
//!
//! The moving parts of the commit-then-publish pipeline.
//!
//! ## Core Components
//!
//! - **Retry Policy** ([`retry`]): fixed-interval, bounded retry configuration
//! - **Connection Lifecycle Manager** ([`connection`]): connects once at
//!   startup with bounded retries, owns the channel, closes it on shutdown
//! - **Event Publisher** ([`publisher`]): publishes one persistent message per
//!   committed record, never retrying and never failing the caller's write
//! - **Event Consumer** ([`consumer`]): sequential manual-ack loop that
//!   acknowledges only after processing succeeds
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{ConnectionManager, EventPublisher, RetryPolicy};
//! use courier_core::{HelloRecord, QueueDescriptor};
//!
//! let queue = QueueDescriptor::durable("hello.queue");
//! let mut manager = ConnectionManager::new(connector);
//! let channel = manager.connect(&url, &RetryPolicy::default(), &queue).await?;
//!
//! let publisher = EventPublisher::new(channel, queue);
//! let record = store.insert("hi").await?;
//! let outcome = publisher.publish_after_commit(&record, HelloRecord::created_event).await;
//!
//! manager.close().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Fixed-interval retry policy for the connect loop
pub mod retry;

/// Broker connection lifecycle
pub mod connection;

/// Commit-then-publish orchestration
pub mod publisher;

/// Manual-acknowledgment consumer loop
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

pub use connection::{ConnectError, ConnectionManager, ConnectionState};
pub use consumer::{ConsumerSummary, EventConsumer, MessageHandler, ProcessingError};
pub use publisher::{EventPublisher, PublishError, PublishOutcome, publish_after_commit};
pub use retry::RetryPolicy;
