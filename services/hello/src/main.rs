//! Hello API server
//!
//! This binary:
//! - Binds the listen address
//! - Opens the store of record (`PostgreSQL`, or in-memory without `DATABASE_URL`)
//! - Connects to the broker and declares the durable queue
//! - Serves `POST /hello`, `GET /health` and `GET /health/ready`
//! - Closes the broker connection on shutdown
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d rabbitmq postgres
//! cargo run --bin hello-api
//!
//! curl -X POST localhost:8000/hello -H 'content-type: application/json' -d '{"message":"hi"}'
//! ```

use anyhow::Context;
use courier_hello::{Config, init_tracing, run_api, shutdown_signal, start_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env().context("Invalid configuration")?;
    tracing::info!(
        queue = %config.broker.queue,
        broker_disabled = config.broker.disabled,
        database = config.database.is_some(),
        "Starting hello-api"
    );

    let _metrics = start_metrics(&config)?;
    run_api(&config, shutdown_signal()).await?;

    tracing::info!("hello-api stopped");
    Ok(())
}
