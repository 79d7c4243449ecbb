//! Store of record abstraction.
//!
//! The store of record commits a fact before anything is published about it.
//! Its write operations return [`Committed`] values, and the publisher only
//! accepts [`Committed`] input, so "publish before commit" does not type-check.
//!
//! # Implementations
//!
//! - `PostgresHelloStore` in `courier-postgres` - production (sqlx)
//! - `InMemoryHelloStore` in `courier-testing` - tests and local runs

use crate::envelope::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur in the store of record.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The write was rolled back and nothing was committed.
    #[error("Transaction rolled back: {0}")]
    RolledBack(String),
}

/// A value that the store of record has durably committed.
///
/// Only stores construct this, after their transaction commits. Dereferences
/// to the inner record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T>(T);

impl<T> Committed<T> {
    /// Mark `record` as committed.
    ///
    /// Call this only after the transaction that wrote `record` has committed
    /// and `record` holds the values read back from storage.
    #[must_use]
    pub const fn assume_committed(record: T) -> Self {
        Self(record)
    }

    /// Unwrap the committed record.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Committed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A row of the `hello_messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRecord {
    /// Identifier assigned by the store on insert.
    pub id: i64,
    /// Message text as stored.
    pub message: String,
    /// Insert time, assigned by the store.
    pub created_at: DateTime<Utc>,
}

impl HelloRecord {
    /// Build the `HelloCreated` envelope for a committed record.
    #[must_use]
    pub fn created_event(record: &Committed<Self>) -> EventEnvelope {
        EventEnvelope::HelloCreated {
            id: record.id,
            message: record.message.clone(),
        }
    }
}

/// Store of record for hello messages.
pub trait HelloStore: Send + Sync {
    /// Insert `message` and commit.
    ///
    /// Returns the row as read back after the commit, including the
    /// store-assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert or the commit fails; nothing is
    /// committed in that case.
    fn insert(
        &self,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Committed<HelloRecord>, StoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_event_carries_committed_id() {
        let record = Committed::assume_committed(HelloRecord {
            id: 7,
            message: "hi".to_string(),
            created_at: Utc::now(),
        });

        assert_eq!(
            HelloRecord::created_event(&record),
            EventEnvelope::HelloCreated {
                id: 7,
                message: "hi".to_string()
            }
        );
    }
}
