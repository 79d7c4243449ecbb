//! `POST /hello`: store a message, then announce it on the broker.

use crate::WebResult;
use crate::error::AppError;
use crate::state::AppState;
use axum::{Json, extract::State, extract::rejection::JsonRejection};
use courier_core::record::HelloRecord;
use serde::Serialize;
use serde_json::Value;

/// Message returned for any body that is not `{"message": "<non-blank>"}`.
pub const INVALID_BODY: &str = r#"Body must be JSON: {"message": "..."}"#;

/// Response body for a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelloResponse {
    /// Identifier assigned by the store
    pub id: i64,
    /// The stored (trimmed) message
    pub message: String,
}

/// Store a hello message and publish `HelloCreated` for it.
///
/// The row is committed before the event is published. A failed or skipped
/// publish does not change the response: the message is stored either way.
///
/// ```text
/// POST /hello
/// {"message": "hi"}
/// ```
///
/// # Errors
///
/// - 400 if the body is not JSON or `message` is missing, not a string, or blank
/// - 500 if the insert fails
pub async fn create_hello(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> WebResult<Json<HelloResponse>> {
    let Json(body) = body.map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected hello body");
        invalid_body()
    })?;
    let message = parse_message(&body).ok_or_else(invalid_body)?;

    let committed = state.store.insert(message).await?;
    tracing::info!(id = committed.id, "Hello message stored");

    let outcome = state
        .publisher
        .publish_after_commit(&committed, HelloRecord::created_event)
        .await;
    tracing::debug!(
        id = committed.id,
        published = outcome.is_published(),
        skipped = outcome.is_skipped(),
        "Hello notification handled"
    );

    let record = committed.into_inner();
    Ok(Json(HelloResponse {
        id: record.id,
        message: record.message,
    }))
}

fn invalid_body() -> AppError {
    metrics::counter!("hello_requests_rejected_total").increment(1);
    AppError::bad_request(INVALID_BODY)
}

/// The trimmed `message` field, if it is a non-blank string.
fn parse_message(body: &Value) -> Option<&str> {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
}
