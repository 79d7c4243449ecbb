//! Hello consumer
//!
//! Pulls `HelloCreated` events from the durable queue one at a time, logs
//! each one, and acknowledges it. Messages that cannot be decoded are
//! rejected without requeue; anything else that fails is requeued.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin hello-consumer
//! ```

use anyhow::Context;
use courier_core::envelope::EventEnvelope;
use courier_hello::{Config, connect_broker, init_tracing, shutdown_signal, start_metrics};
use courier_runtime::{EventConsumer, ProcessingError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().context("Invalid configuration")?;
    anyhow::ensure!(
        !config.broker.disabled,
        "BROKER_DISABLED is set; hello-consumer has nothing to consume"
    );
    tracing::info!(queue = %config.broker.queue, "Starting hello-consumer");

    let _metrics = start_metrics(&config)?;
    let (mut manager, channel) = connect_broker(&config.broker, "hello-consumer").await?;
    let channel = channel.context("Broker channel missing after connect")?;

    let consumer = EventConsumer::new(channel, config.broker.queue(), log_event)
        .with_processing_timeout(config.broker.processing_timeout)
        .with_consumer_tag("hello-consumer");

    let result = consumer.run(shutdown_signal()).await;
    manager.close().await;

    let summary = result.context("Consumer stopped unexpectedly")?;
    tracing::info!(
        acked = summary.acked,
        requeued = summary.requeued,
        rejected = summary.rejected,
        "hello-consumer stopped"
    );
    Ok(())
}

#[allow(clippy::unused_async)]
async fn log_event(envelope: EventEnvelope) -> Result<(), ProcessingError> {
    match envelope {
        EventEnvelope::HelloCreated { id, message } => {
            tracing::info!(id, message = %message, "Received HelloCreated");
        },
    }
    Ok(())
}
