//! Posts sealed envelopes to a running `relay_publisher` and reports the
//! accepted rate and the 503 count once a second.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use serde_json::json;

use relay_common::codec::EnvelopeCodec;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Ingestion API base, e.g. http://127.0.0.1:6100/api
    #[clap(long, default_value = "http://127.0.0.1:6100/api")]
    api: String,

    /// Base64 AES key shared with the subscriber
    #[clap(long, env = "RELAY_AES_KEY", hide_env_values = true)]
    key: String,

    /// Total envelopes to post
    #[clap(short, long, default_value_t = 1000)]
    count: u64,

    /// Concurrent posting tasks
    #[clap(short, long, default_value_t = 8)]
    workers: u64,
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let codec = EnvelopeCodec::from_base64_key(&args.key)?;
    let client = reqwest::Client::new();
    let stats = Arc::new(Stats::default());
    let url = format!("{}/data", args.api.trim_end_matches('/'));

    let reporter = {
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut last = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let accepted = stats.accepted.load(Ordering::Relaxed);
                println!(
                    "accepted {} ({}/s), queue full {}, failed {}",
                    accepted,
                    accepted - last,
                    stats.rejected.load(Ordering::Relaxed),
                    stats.failed.load(Ordering::Relaxed)
                );
                last = accepted;
            }
        })
    };

    let started = Instant::now();
    let mut tasks = Vec::new();
    for worker in 0..args.workers {
        let client = client.clone();
        let codec = codec.clone();
        let stats = Arc::clone(&stats);
        let url = url.clone();
        let (count, workers) = (args.count, args.workers);
        tasks.push(tokio::spawn(async move {
            let mut sequence = worker;
            while sequence < count {
                let task_id = if sequence % 2 == 0 { "load_top" } else { "load_deal" };
                let body = json!({
                    "task_id": task_id,
                    "payload": {"sequence": sequence, "timestamp": Utc::now().timestamp_millis(), "data": "x".repeat(256)},
                });
                let envelope = match codec.encrypt(&body.to_string()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        eprintln!("encrypt failed: {}", e);
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        sequence += workers;
                        continue;
                    }
                };
                match client.post(&url).body(envelope).send().await {
                    Ok(r) if r.status().is_success() => stats.accepted.fetch_add(1, Ordering::Relaxed),
                    Ok(r) if r.status().as_u16() == 503 => stats.rejected.fetch_add(1, Ordering::Relaxed),
                    Ok(_) | Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
                };
                sequence += workers;
            }
        }));
    }
    for task in tasks {
        task.await?;
    }
    reporter.abort();

    let elapsed = started.elapsed().as_secs_f64();
    let accepted = stats.accepted.load(Ordering::Relaxed);
    println!(
        "done: {} accepted in {:.2}s ({:.0}/s), queue full {}, failed {}",
        accepted,
        elapsed,
        accepted as f64 / elapsed.max(f64::EPSILON),
        stats.rejected.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed)
    );
    Ok(())
}
