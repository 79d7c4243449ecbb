//! Application state for Axum handlers.

use courier_core::record::HelloStore;
use courier_runtime::{ConnectionState, EventPublisher};
use std::sync::Arc;
use tokio::sync::watch;

/// Application state shared across all HTTP handlers.
///
/// # Examples
///
/// ```ignore
/// let state = AppState::new(Arc::new(store), EventPublisher::new(channel, queue))
///     .with_broker_state(manager.subscribe());
/// let app = courier_web::router(state);
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Store of record for hello messages
    pub store: Arc<dyn HelloStore>,
    /// Publisher for committed records
    pub publisher: EventPublisher,
    /// Connection state feed; `None` when the broker is disabled
    pub broker_state: Option<watch::Receiver<ConnectionState>>,
}

impl AppState {
    /// State with no broker state feed (broker disabled).
    #[must_use]
    pub fn new(store: Arc<dyn HelloStore>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            broker_state: None,
        }
    }

    /// Report readiness from the given connection state feed.
    #[must_use]
    pub fn with_broker_state(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.broker_state = Some(state);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone_and_send() {
        fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
        assert_bounds::<AppState>();
    }
}
