//! # Configs Module
//!
//! Layered configuration for the two relay binaries, plus the `.env` loader
//! the binaries run before parsing.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Publisher and subscriber configuration layers.
pub mod relay_config;

pub use relay_config::{
    LogArgs, LogConfig, PublisherArgs, PublisherConfig, RetryArgs, SubscriberArgs, SubscriberConfig,
    DEFAULT_PUBLISHER_CONFIG, DEFAULT_SUBSCRIBER_CONFIG,
};

/// Loads the platform file (`.env.linux` or `.env.windows`) and then `.env`
/// from the working directory. Missing files are ignored. Neither file
/// overrides a variable that is already set, so the process environment wins
/// over the platform file, which wins over `.env`.
pub fn load_dotenv() {
    let platform_file = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    let _ = dotenvy::from_filename(platform_file);
    let _ = dotenvy::dotenv();
}
