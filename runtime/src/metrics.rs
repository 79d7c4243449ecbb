//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the pipeline:
//! - Broker connection attempts and state
//! - Publish outcomes and latency
//! - Consumer acknowledgments and processing latency
//!
//! Recording is always on; without an installed recorder the `metrics`
//! macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::connection::ConnectionState;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping. Must be
/// started from within a tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Whether [`start`](Self::start) installed the exporter.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Register metric descriptions, install the recorder and start the HTTP
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed (for
    /// example because another recorder is already installed).
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        builder
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        self.started = true;
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Connection Metrics
    describe_counter!(
        "broker_connect_attempts_total",
        "Total number of broker connect attempts"
    );
    describe_counter!(
        "broker_connect_failures_total",
        "Total number of connect loops that gave up"
    );
    describe_gauge!(
        "broker_connection_state",
        "Broker connection state (0=disconnected, 1=connecting, 2=connected, 3=failed)"
    );

    // Publish Metrics
    describe_counter!(
        "events_published_total",
        "Total number of events accepted by the broker"
    );
    describe_counter!(
        "events_publish_skipped_total",
        "Total number of events not published because the broker is disabled"
    );
    describe_counter!(
        "events_publish_failed_total",
        "Total number of events whose publish failed or timed out"
    );
    describe_histogram!(
        "event_publish_duration_seconds",
        "Time taken by a single publish round-trip"
    );

    // Consumer Metrics
    describe_counter!(
        "events_acked_total",
        "Total number of deliveries acknowledged after processing"
    );
    describe_counter!(
        "events_requeued_total",
        "Total number of deliveries rejected for redelivery"
    );
    describe_counter!(
        "events_rejected_total",
        "Total number of deliveries rejected without redelivery"
    );
    describe_histogram!(
        "event_processing_duration_seconds",
        "Time taken to process one delivery"
    );
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a connect attempt.
    pub fn record_attempt() {
        counter!("broker_connect_attempts_total").increment(1);
    }

    /// Record a connect loop that gave up.
    pub fn record_failure() {
        counter!("broker_connect_failures_total").increment(1);
    }

    /// Record the current connection state.
    pub fn record_state(state: ConnectionState) {
        gauge!("broker_connection_state").set(state.as_gauge());
    }
}

/// Publish metrics recorder.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a broker-accepted publish.
    pub fn record_published(event_type: &'static str, duration: Duration) {
        counter!("events_published_total", "event_type" => event_type).increment(1);
        histogram!("event_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish skipped because no channel exists.
    pub fn record_skipped() {
        counter!("events_publish_skipped_total").increment(1);
    }

    /// Record a failed publish.
    pub fn record_failed() {
        counter!("events_publish_failed_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record an acknowledged delivery.
    pub fn record_acked(duration: Duration) {
        counter!("events_acked_total").increment(1);
        histogram!("event_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a delivery rejected with requeue.
    pub fn record_requeued() {
        counter!("events_requeued_total").increment(1);
    }

    /// Record a delivery rejected without requeue.
    pub fn record_rejected() {
        counter!("events_rejected_total").increment(1);
    }
}
