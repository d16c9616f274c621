//! # Relay Publisher
//!
//! Edge-side half of the telemetry relay. Crawlers POST encrypted envelopes
//! to the `/api` endpoints; the payloads are buffered in the relay queue and
//! published as data frames to every connected subscriber, alongside a
//! periodic heartbeat.
//!
//! Configuration comes from defaults, `relay_publisher.json`, `RELAY_*`
//! environment variables and flags, in increasing priority. Run with
//! `--help` for the full list.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use static_init::dynamic;
use tokio::net::TcpListener;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info};

use relay_common::configs::{PublisherConfig, load_dotenv};
use relay_common::core::{Publisher, RelayQueue};
use relay_common::ingestors::{IngestState, serve};
use relay_common::loggers::setup_logging;
use relay_common::transport::TcpFrameSink;

/// Loads `.env` files before anything reads the environment.
#[dynamic]
static DOTENV_INIT: () = load_dotenv();

const APP_NAME: &str = "relay_publisher";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match PublisherConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", APP_NAME, e);
            std::process::exit(2);
        }
    };

    let _guard = match setup_logging(&config.log.dir, APP_NAME, &config.log.level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    info!(?config, "Starting {}", APP_NAME);

    let queue = RelayQueue::new(config.queue_capacity);
    let sink = TcpFrameSink::bind(&config.bind_address)?;
    let publisher = Arc::new(Publisher::new(
        queue.clone(),
        Arc::new(sink),
        config.publisher_settings(),
        None,
    )?);
    publisher.start()?;

    let listener = TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    let state = IngestState::new(queue, config.enqueue_timeout, config.bind_address.clone())
        .with_publisher(Arc::clone(&publisher));

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard: ShutdownGuard| async move {
        let signal = async move { guard.cancelled().await };
        if let Err(e) = serve(listener, state, signal).await {
            error!("Ingestion API stopped: {}", e);
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    // Stopping joins OS threads.
    let stopping = Arc::clone(&publisher);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        error!("Publisher stop failed: {}", e);
    }
    info!(unsent = publisher.queue().len(), "Publisher stopped");

    info!("Bye!");
    Ok(())
}
