//! # Relay Subscriber
//!
//! Internal-side half of the telemetry relay. Connects to the publisher,
//! watches its heartbeat, opens each data envelope and forwards the decoded
//! JSON to the analytics API. Frames that fail anywhere in that chain are
//! retried with exponential backoff and dead-lettered to the log when the
//! retries run out.
//!
//! The pipeline runs on plain OS threads with a blocking HTTP client, so
//! `main` is synchronous. A current-thread runtime exists only to wait for
//! the termination signal.

use std::sync::Arc;

use anyhow::Result;
use static_init::dynamic;
use tokio::signal;
use tracing::{error, info};

use relay_common::configs::{SubscriberConfig, load_dotenv};
use relay_common::core::{DataHandler, Subscriber};
use relay_common::loggers::setup_logging;
use relay_common::retrieve::HttpForwarder;
use relay_common::transport::TcpFrameSource;

/// Loads `.env` files before anything reads the environment.
#[dynamic]
static DOTENV_INIT: () = load_dotenv();

const APP_NAME: &str = "relay_subscriber";

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        error!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

fn main() -> Result<()> {
    let config = match SubscriberConfig::load() {
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

    let forwarder = HttpForwarder::new(config.forwarder.clone())?;
    let handler = DataHandler::new(config.codec.clone(), Arc::new(forwarder));
    let source = TcpFrameSource::new(&config.connect_address);
    let subscriber = Subscriber::new(Arc::new(source), handler, config.subscriber_settings(), None)?;

    if let Err(e) = subscriber.start() {
        error!("Cannot reach publisher at {}: {}", config.connect_address, e);
        subscriber.stop();
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_signal());
    drop(runtime);

    subscriber.stop();
    info!(
        heartbeat_age_secs = subscriber.last_heartbeat_age().as_secs_f64(),
        "Subscriber stopped"
    );
    info!("Bye!");
    Ok(())
}
