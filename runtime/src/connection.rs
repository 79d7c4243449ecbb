//! Connection lifecycle for the broker.
//!
//! A [`ConnectionManager`] is created once per process. It connects at
//! startup with a bounded, fixed-interval retry loop, owns the resulting
//! channel for the life of the process, and closes it on shutdown. Other
//! components receive clones of the channel handle and never open or close
//! connections themselves.
//!
//! # State Machine
//!
//! ```text
//!                 connect()
//! ┌──────────────┐ ───────► ┌────────────┐  success  ┌───────────┐
//! │ Disconnected │          │ Connecting │ ────────► │ Connected │
//! └──────────────┘ ◄─┐      └─────┬──────┘           └─────┬─────┘
//!                    │            │ attempts exhausted     │
//!                    │            ▼ or permanent error     │
//!                    │      ┌────────────┐                 │
//!                    │      │   Failed   │ (terminal)      │
//!                    │      └────────────┘                 │
//!                    └────────────── close() ──────────────┘
//! ```
//!
//! Only the manager's own connect loop writes the state. Observers such as
//! health endpoints read it through a [`watch`] receiver from
//! [`ConnectionManager::subscribe`].

use crate::metrics::ConnectionMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use courier_core::broker::{BrokerChannel, BrokerError, Connector, QueueDescriptor};
use courier_core::environment::{Sleeper, TokioSleeper};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Health of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection, not trying to connect.
    Disconnected,
    /// The connect loop is running.
    Connecting,
    /// A channel is open and the queue is declared.
    Connected,
    /// The connect loop gave up. Terminal for this manager.
    Failed,
}

impl ConnectionState {
    /// Numeric encoding for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Failed => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from [`ConnectionManager::connect`]. All of them are fatal to the
/// hosting process.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Every attempt failed with a transient error.
    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: BrokerError,
    },

    /// An attempt failed in a way retrying cannot fix.
    #[error("Broker connection failed permanently on attempt {attempt}: {error}")]
    Fatal {
        /// The attempt (1-based) that failed
        attempt: u32,
        /// The permanent error
        error: BrokerError,
    },

    /// This manager already failed; the process must restart to retry.
    #[error("Connection manager has failed; restart the process to reconnect")]
    Terminal,

    /// The manager was built with [`ConnectionManager::disabled`].
    #[error("Broker is disabled by configuration")]
    Disabled,
}

impl From<RetryError<BrokerError>> for ConnectError {
    fn from(err: RetryError<BrokerError>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => Self::Exhausted {
                attempts,
                last_error,
            },
            RetryError::NotRetryable { attempt, error } => Self::Fatal { attempt, error },
        }
    }
}

/// Owns the broker connection and its single channel.
///
/// # Example
///
/// ```ignore
/// let mut manager = ConnectionManager::new(Arc::new(AmqpConnector::default()));
/// let channel = manager.connect(&url, &policy, &queue).await?;
/// // ... hand `channel` to the publisher ...
/// manager.close().await;
/// ```
pub struct ConnectionManager {
    /// `None` when the broker is disabled by configuration
    connector: Option<Arc<dyn Connector>>,
    sleeper: Arc<dyn Sleeper>,
    state: watch::Sender<ConnectionState>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl ConnectionManager {
    /// Create a manager that connects through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: Some(connector),
            sleeper: Arc::new(TokioSleeper),
            state,
            channel: None,
        }
    }

    /// Create a manager for a deployment without a broker.
    ///
    /// It never connects; [`close`](Self::close) is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: None,
            sleeper: Arc::new(TokioSleeper),
            state,
            channel: None,
        }
    }

    /// Replace the sleeper used between connect attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Whether this manager has a connector at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.connector.is_some()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The open channel, if connected.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.clone()
    }

    /// Connect to `url`, open a channel and declare `queue`.
    ///
    /// Transient failures are retried every `policy.backoff_interval()` up to
    /// `policy.max_attempts()` attempts in total. A channel that connected but
    /// could not declare the queue is closed before the next attempt. The
    /// returned channel is fully usable; there is no partial success.
    ///
    /// Calling this on a connected manager returns the existing channel.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Exhausted`] when every attempt failed transiently
    /// - [`ConnectError::Fatal`] on the first permanent failure
    /// - [`ConnectError::Terminal`] if the manager already failed
    /// - [`ConnectError::Disabled`] for a disabled manager
    pub async fn connect(
        &mut self,
        url: &str,
        policy: &RetryPolicy,
        queue: &QueueDescriptor,
    ) -> Result<Arc<dyn BrokerChannel>, ConnectError> {
        if let Some(channel) = &self.channel {
            return Ok(Arc::clone(channel));
        }
        if self.state() == ConnectionState::Failed {
            return Err(ConnectError::Terminal);
        }
        let Some(connector) = self.connector.clone() else {
            return Err(ConnectError::Disabled);
        };

        self.transition(ConnectionState::Connecting);
        tracing::info!(
            broker = %redact(url),
            queue = %queue,
            durable = queue.durable,
            max_attempts = policy.max_attempts(),
            "Connecting to broker"
        );

        let connector = connector.as_ref();
        let result = retry_with_predicate(
            policy,
            self.sleeper.as_ref(),
            |attempt| {
                ConnectionMetrics::record_attempt();
                tracing::debug!(attempt, "Opening broker channel");
                open_channel(connector, url, queue)
            },
            BrokerError::is_transient,
        )
        .await;

        match result {
            Ok(channel) => {
                self.channel = Some(Arc::clone(&channel));
                self.transition(ConnectionState::Connected);
                tracing::info!(queue = %queue, "Broker connected and queue declared");
                Ok(channel)
            },
            Err(err) => {
                self.transition(ConnectionState::Failed);
                ConnectionMetrics::record_failure();
                let err = ConnectError::from(err);
                tracing::error!(error = %err, "Broker connection failed");
                Err(err)
            },
        }
    }

    /// Release the channel and its connection.
    ///
    /// Idempotent. Safe before any connect, on a disabled manager, and after
    /// a failed connect. A close error is logged; the handle is dropped
    /// either way.
    pub async fn close(&mut self) {
        let Some(channel) = self.channel.take() else {
            tracing::debug!(state = %self.state(), "No broker channel to close");
            return;
        };

        if let Err(error) = channel.close().await {
            tracing::warn!(error = %error, "Broker channel did not close cleanly");
        }
        self.transition(ConnectionState::Disconnected);
        tracing::info!("Broker connection closed");
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Connection state changed");
        }
        ConnectionMetrics::record_state(next);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .field("has_channel", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

/// One connect attempt: connection + channel + queue declaration.
async fn open_channel(
    connector: &dyn Connector,
    url: &str,
    queue: &QueueDescriptor,
) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
    let channel = connector.connect(url).await?;

    if let Err(error) = channel.declare_queue(queue).await {
        if let Err(close_error) = channel.close().await {
            tracing::debug!(
                error = %close_error,
                "Failed to close channel after declare failure"
            );
        }
        return Err(error);
    }

    Ok(channel)
}

/// Strip credentials from a broker URL for logging.
fn redact(url: &str) -> &str {
    url.rsplit('@').next().unwrap_or(url)
}
