//! `PostgreSQL` store of record for Courier.
//!
//! This crate implements the [`HelloStore`] trait from `courier-core` on top
//! of sqlx. Every insert runs in its own transaction and is returned as a
//! [`Committed`] value only after `COMMIT` succeeded, so the publisher never
//! sees a row that could still roll back.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE hello_messages (
//!     id         BIGSERIAL PRIMARY KEY,
//!     message    TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! [`PostgresHelloStore::migrate`] creates it if missing.
//!
//! # Example
//!
//! ```ignore
//! use courier_postgres::PostgresHelloStore;
//! use courier_core::record::HelloStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresHelloStore::new("postgres://localhost/courier").await?;
//!     store.migrate().await?;
//!
//!     let record = store.insert("hi").await?;
//!     println!("committed id {}", record.id);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use courier_core::record::{Committed, HelloRecord, HelloStore, StoreError};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// `PostgreSQL`-backed [`HelloStore`].
#[derive(Debug, Clone)]
pub struct PostgresHelloStore {
    pool: PgPool,
}

impl PostgresHelloStore {
    /// Connect with the default pool size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the database is unreachable.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `hello_messages` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the DDL fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS hello_messages (
                id BIGSERIAL PRIMARY KEY,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        tracing::debug!("hello_messages table ready");
        Ok(())
    }

    async fn insert_committed(&self, message: &str) -> Result<Committed<HelloRecord>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let row = sqlx::query(
            r"
            INSERT INTO hello_messages (message)
            VALUES ($1)
            RETURNING id, message, created_at
            ",
        )
        .bind(message)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::RolledBack(e.to_string()))?;

        let record = record_from_row(&row)?;

        // Dropping `tx` on any error above rolls the insert back.
        tx.commit()
            .await
            .map_err(|e| StoreError::RolledBack(e.to_string()))?;

        tracing::debug!(id = record.id, "hello message committed");
        metrics::counter!("hello_messages_committed_total").increment(1);

        Ok(Committed::assume_committed(record))
    }
}

fn record_from_row(row: &PgRow) -> Result<HelloRecord, StoreError> {
    let column = |e: sqlx::Error| StoreError::DatabaseError(e.to_string());

    let id: i64 = row.try_get("id").map_err(column)?;
    let message: String = row.try_get("message").map_err(column)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(column)?;

    Ok(HelloRecord {
        id,
        message,
        created_at,
    })
}

impl HelloStore for PostgresHelloStore {
    fn insert(
        &self,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Committed<HelloRecord>, StoreError>> + Send + '_>> {
        let message = message.to_string();
        Box::pin(async move { self.insert_committed(&message).await })
    }
}
