//! # Courier Testing
//!
//! Testing utilities for the Courier pipeline.
//!
//! This crate provides:
//! - [`FakeBroker`]: an in-memory broker with scriptable failures
//! - Mock implementations of the store of record and the sleeper
//!
//! With these, the connect loop, the publisher and the consumer can be
//! exercised without RabbitMQ, PostgreSQL or real delays.
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{FakeBroker, RecordingSleeper};
//! use courier_runtime::{ConnectionManager, RetryPolicy};
//!
//! #[tokio::test]
//! async fn connects_after_two_refusals() {
//!     let broker = FakeBroker::new();
//!     broker.fail_connects(2);
//!     let sleeper = RecordingSleeper::new();
//!
//!     let mut manager = ConnectionManager::new(Arc::new(broker.clone()))
//!         .with_sleeper(Arc::new(sleeper.clone()));
//!     manager.connect("amqp://fake", &RetryPolicy::default(), &queue).await.unwrap();
//!
//!     assert_eq!(broker.connect_attempts(), 3);
//!     assert_eq!(sleeper.recorded().len(), 2);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_broker;

/// Mock implementations of environment and storage traits.
pub mod mocks {
    use chrono::{DateTime, Utc};
    use courier_core::environment::Sleeper;
    use courier_core::record::{Committed, HelloRecord, HelloStore, StoreError};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    /// Sleeper that records requested durations and returns immediately.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::RecordingSleeper;
    /// use courier_core::environment::Sleeper;
    /// use std::time::Duration;
    ///
    /// # async fn example() {
    /// let sleeper = RecordingSleeper::new();
    /// sleeper.sleep(Duration::from_secs(2)).await;
    /// assert_eq!(sleeper.recorded(), vec![Duration::from_secs(2)]);
    /// # }
    /// ```
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSleeper {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        /// Create a sleeper with no recorded sleeps.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every duration requested so far, in order.
        #[must_use]
        pub fn recorded(&self) -> Vec<Duration> {
            self.sleeps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.sleeps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(duration);
            Box::pin(std::future::ready(()))
        }
    }

    #[derive(Debug, Default)]
    struct StoreState {
        records: Vec<HelloRecord>,
        last_id: i64,
        fail_next_insert: bool,
    }

    /// In-memory store of record.
    ///
    /// Ids are assigned sequentially from 1. Used by tests and by the API
    /// binary when no `DATABASE_URL` is configured.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryHelloStore {
        state: Arc<Mutex<StoreState>>,
    }

    impl InMemoryHelloStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, StoreState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Roll back the next insert instead of committing it.
        pub fn fail_next_insert(&self) {
            self.lock().fail_next_insert = true;
        }

        /// Every committed record, in insert order.
        #[must_use]
        pub fn records(&self) -> Vec<HelloRecord> {
            self.lock().records.clone()
        }

        fn insert_now(&self, message: &str) -> Result<Committed<HelloRecord>, StoreError> {
            let mut state = self.lock();
            if std::mem::take(&mut state.fail_next_insert) {
                return Err(StoreError::RolledBack(
                    "simulated commit failure".to_string(),
                ));
            }

            state.last_id += 1;
            let record = HelloRecord {
                id: state.last_id,
                message: message.to_string(),
                created_at: Utc::now(),
            };
            state.records.push(record.clone());
            Ok(Committed::assume_committed(record))
        }
    }

    impl HelloStore for InMemoryHelloStore {
        fn insert(
            &self,
            message: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Committed<HelloRecord>, StoreError>> + Send + '_>>
        {
            Box::pin(std::future::ready(self.insert_now(message)))
        }
    }

    /// A committed record with a fixed timestamp (2025-01-01 00:00:00 UTC).
    #[must_use]
    pub fn committed_record(id: i64, message: &str) -> Committed<HelloRecord> {
        Committed::assume_committed(HelloRecord {
            id,
            message: message.to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089),
        })
    }
}

// Re-export commonly used items
pub use fake_broker::{FakeBroker, NackedMessage, PublishedMessage};
pub use mocks::{InMemoryHelloStore, RecordingSleeper, committed_record};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use courier_core::record::{HelloStore, StoreError};

    #[tokio::test]
    async fn in_memory_store_assigns_sequential_ids() {
        let store = InMemoryHelloStore::new();

        let first = store.insert("a").await.unwrap();
        let second = store.insert("b").await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        let messages: Vec<_> = store.records().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, ["a", "b"]);
    }

    #[tokio::test]
    async fn rolled_back_insert_is_not_visible() {
        let store = InMemoryHelloStore::new();
        store.fail_next_insert();

        assert!(matches!(
            store.insert("lost").await,
            Err(StoreError::RolledBack(_))
        ));
        assert!(store.records().is_empty());

        assert_eq!(store.insert("kept").await.unwrap().id, 1);
    }

    #[test]
    fn committed_record_has_fixed_timestamp() {
        let record = committed_record(7, "hi");
        assert_eq!(record.created_at.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
