//! HTTP surface of the Courier hello service.
//!
//! A thin axum layer over the pipeline: a request handler commits a record
//! through the store, then hands it to the [`EventPublisher`] for a single
//! publish attempt.
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at `POST /hello`
//! 2. **Validate** the JSON body
//! 3. **Commit** the message through the store of record
//! 4. **Publish** `HelloCreated` (at most one attempt, bounded by a timeout)
//! 5. **Respond** with the stored row, whatever the publish outcome
//!
//! # Example
//!
//! ```ignore
//! use courier_web::{AppState, router};
//!
//! let state = AppState::new(store, publisher).with_broker_state(manager.subscribe());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, router(state)).await?;
//! ```
//!
//! [`EventPublisher`]: courier_runtime::EventPublisher

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod state;

pub use error::AppError;
pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Build the service router.
///
/// Routes:
/// - `POST /hello`
/// - `GET /health`
/// - `GET /health/ready`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hello", post(handlers::create_hello))
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
