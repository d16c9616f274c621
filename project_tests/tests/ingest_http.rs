//! The ingestion API served on a real socket and driven with `reqwest`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use relay_common::core::{Publisher, PublisherSettings, RelayQueue};
use relay_common::ingestors::{IngestState, serve};
use relay_common::transport::memory;
use relay_common::transport::{FrameSource, FrameTag};

struct Api {
    base: String,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Api {
    async fn start(state: IngestState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            serve(listener, state, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            base,
            stop: Some(tx),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queue_answers_503() {
    let queue = RelayQueue::new(1);
    let api = Api::start(IngestState::new(queue.clone(), Duration::from_millis(100), "tcp://0.0.0.0:6666")).await;
    let client = reqwest::Client::new();

    let first = client.post(api.url("/data")).body("envelope-1").send().await.unwrap();
    assert_eq!(first.status(), 200);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body, json!({"status": "success", "message": "Data received"}));

    let second = client.post(api.url("/data")).body("envelope-2").send().await.unwrap();
    assert_eq!(second.status(), 503);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "Queue full, try again later");

    assert_eq!(queue.len(), 1);
    api.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_counts_accepted_and_rejected() {
    let queue = RelayQueue::new(2);
    let api = Api::start(IngestState::new(queue.clone(), Duration::from_millis(50), "tcp://0.0.0.0:6666")).await;
    let client = reqwest::Client::new();

    let response = client
        .post(api.url("/batch_data"))
        .body(r#"["first", {"k": 1}, "third"]"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["rejected"], 1);
    assert_eq!(body["message"], "Received 2 data items");

    let first = queue.dequeue(Duration::from_millis(10)).unwrap();
    let second = queue.dequeue(Duration::from_millis(10)).unwrap();
    assert_eq!(first.payload, "first");
    assert_eq!(second.payload, r#"{"k":1}"#);

    let bad = client.post(api.url("/batch_data")).body(r#"{"not": "an array"}"#).send().await.unwrap();
    assert_eq!(bad.status(), 400);
    let body: Value = bad.json().await.unwrap();
    assert_eq!(body["error"], "Expected JSON array");

    api.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_into_full_queue_waits_once() {
    let queue = RelayQueue::new(1);
    let api = Api::start(IngestState::new(queue.clone(), Duration::from_millis(300), "tcp://0.0.0.0:6666")).await;
    let items: Vec<String> = (0..11).map(|i| format!("envelope-{}", i)).collect();

    let started = Instant::now();
    let response = reqwest::Client::new()
        .post(api.url("/batch_data"))
        .body(serde_json::to_string(&items).unwrap())
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["rejected"], 10);
    assert!(elapsed < Duration::from_millis(1500), "batch took {:?}", elapsed);
    assert_eq!(queue.dequeue(Duration::from_millis(10)).unwrap().payload, "envelope-0");

    api.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn health_and_stats_report_queue() {
    let queue = RelayQueue::new(10);
    let (sink, _source) = memory::channel(4);
    let publisher = Arc::new(Publisher::new(queue.clone(), Arc::new(sink), PublisherSettings::default(), None).unwrap());
    let state = IngestState::new(queue.clone(), Duration::from_millis(50), "tcp://0.0.0.0:7777").with_publisher(publisher);
    let api = Api::start(state).await;
    let client = reqwest::Client::new();

    client.post(api.url("/data")).body("x").send().await.unwrap();

    let health: Value = client.get(api.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["queue_size"], 1);
    assert_eq!(health["publisher_state"], "INIT");
    assert!(health["timestamp"].as_f64().unwrap() > 1.0e9);

    let stats: Value = client.get(api.url("/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(
        stats,
        json!({"queue_size": 1, "max_queue_size": 10, "transport_address": "tcp://0.0.0.0:7777"})
    );

    api.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn posted_text_reaches_transport() {
    let queue = RelayQueue::new(10);
    let (sink, source) = memory::channel(16);
    let settings = PublisherSettings {
        dequeue_timeout: Duration::from_millis(50),
        ..PublisherSettings::default()
    };
    let publisher = Arc::new(Publisher::new(queue.clone(), Arc::new(sink), settings, None).unwrap());
    publisher.start().unwrap();
    let api = Api::start(IngestState::new(queue, Duration::from_secs(1), "memory").with_publisher(publisher.clone())).await;

    let response = reqwest::Client::new()
        .post(api.url("/data"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let frame = tokio::task::spawn_blocking(move || {
        for _ in 0..50 {
            if let Some(frame) = source.recv(Duration::from_millis(100)).unwrap() {
                if frame.tag == FrameTag::Data {
                    return Some(frame);
                }
            }
        }
        None
    })
    .await
    .unwrap()
    .expect("no data frame published");
    assert_eq!(frame.payload, b"hello");

    api.shutdown().await;
    tokio::task::spawn_blocking(move || publisher.stop()).await.unwrap();
}
