//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use courier_runtime::ConnectionState;
use serde::Serialize;

/// Liveness probe.
///
/// Returns 200 OK while the process is serving requests. Does not look at
/// the broker or the database.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Body of the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// Broker connection state, or `"disabled"`
    pub broker: String,
}

/// Readiness probe.
///
/// # Status Codes
///
/// - 200 OK: broker connected, or disabled by configuration
/// - 503 Service Unavailable: any other connection state
///
/// ```text
/// GET /health/ready
/// ```
///
/// ```json
/// { "broker": "connected" }
/// ```
#[allow(clippy::unused_async)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let Some(feed) = &state.broker_state else {
        return (
            StatusCode::OK,
            Json(Readiness {
                broker: "disabled".to_string(),
            }),
        );
    };

    let current = *feed.borrow();
    let status = if current == ConnectionState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(Readiness {
            broker: current.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
