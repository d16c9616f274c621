use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;

use crate::errors::{RelayError, RelayResult};

/// Downstream consumer of decoded telemetry.
pub trait Forwarder: Send + Sync {
    /// Delivers one decoded payload. Any error is retried by the caller.
    fn forward(&self, payload: &Value) -> RelayResult<()>;
}

/// Connection settings for [`HttpForwarder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderSettings {
    /// Scheme and authority of the analytics API, e.g. `http://10.0.0.5`.
    pub host: String,
    /// Path for ranking ("top") payloads.
    pub top_path: String,
    /// Path for transaction ("deal") payloads.
    pub deal_path: String,
    /// Value of the `crawler-code` header.
    pub crawler_code: String,
    /// Connect and read timeout.
    pub timeout: Duration,
    /// When `false`, payloads are acknowledged without calling the API.
    pub push_data: bool,
}

impl ForwarderSettings {
    /// Settings for `host` with the stock paths and header value.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            top_path: "/monitor/crawler/parseTopData".to_string(),
            deal_path: "/monitor/crawler/parseDealData".to_string(),
            crawler_code: "gs-znzx-fd-crawler".to_string(),
            timeout: Duration::from_secs(30),
            push_data: true,
        }
    }
}

/// Which downstream endpoint a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Ranking data.
    Top,
    /// Transaction data.
    Deal,
}

fn task_id(value: &Value) -> Option<&str> {
    ["task_id", "taskId"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
}

/// Picks the endpoint from the task identifier naming convention: an id
/// ending in `deal` (any case) is transaction data, everything else is
/// ranking data.
pub fn route_for(payload: &Value) -> Route {
    let id = task_id(payload).or_else(|| payload.get("payload").and_then(task_id));
    match id {
        Some(id) if id.to_ascii_lowercase().ends_with("deal") => Route::Deal,
        _ => Route::Top,
    }
}

/// POSTs decoded payloads to the analytics API.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    settings: ForwarderSettings,
}

impl HttpForwarder {
    /// Builds the blocking HTTP client.
    pub fn new(settings: ForwarderSettings) -> RelayResult<Self> {
        let client = Client::builder()
            .connect_timeout(settings.timeout)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| RelayError::FatalConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }

    /// Full URL for `route`.
    pub fn url_for(&self, route: Route) -> String {
        let path = match route {
            Route::Top => &self.settings.top_path,
            Route::Deal => &self.settings.deal_path,
        };
        format!("{}{}", self.settings.host.trim_end_matches('/'), path)
    }
}

impl Forwarder for HttpForwarder {
    fn forward(&self, payload: &Value) -> RelayResult<()> {
        if !self.settings.push_data {
            tracing::info!("push_data disabled; payload acknowledged without forwarding");
            return Ok(());
        }

        let url = self.url_for(route_for(payload));
        let response = self
            .client
            .post(&url)
            .header("crawler-code", &self.settings.crawler_code)
            .json(payload)
            .send()
            .map_err(|e| RelayError::Downstream(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        if status != StatusCode::OK {
            return Err(RelayError::Downstream(format!("{} answered {}: {}", url, status, body)));
        }
        let accepted = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("success").and_then(Value::as_bool))
            .unwrap_or(false);
        if !accepted {
            return Err(RelayError::Downstream(format!("{} rejected payload: {}", url, body)));
        }

        tracing::info!(url = %url, "Payload forwarded: {}", body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves one request with `status` and `body`, returning the raw request
    /// head and body it received.
    fn one_shot_server(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let host = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push_str(&line);
            }
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            (head, String::from_utf8(request_body).unwrap())
        });
        (host, handle)
    }

    fn forwarder(host: String) -> HttpForwarder {
        let mut settings = ForwarderSettings::new(host);
        settings.timeout = Duration::from_secs(5);
        HttpForwarder::new(settings).unwrap()
    }

    #[test]
    fn test_route_selection() {
        assert_eq!(route_for(&json!({"task_id": "jd_top"})), Route::Top);
        assert_eq!(route_for(&json!({"task_id": "jd_DEAL"})), Route::Deal);
        assert_eq!(route_for(&json!({"taskId": "tmall-deal"})), Route::Deal);
        assert_eq!(route_for(&json!({"payload": {"task_id": "x_deal"}})), Route::Deal);
        assert_eq!(route_for(&json!({"task_id": "dealer_top"})), Route::Top);
        assert_eq!(route_for(&json!({"task_id": 7})), Route::Top);
        assert_eq!(route_for(&json!("plain")), Route::Top);
    }

    #[test]
    fn test_forward_success() {
        let (host, server) = one_shot_server("200 OK", r#"{"success":true,"msg":"ok"}"#);
        let payload = json!({"task_id": "shop_deal", "data": [1, 2]});

        forwarder(host).forward(&payload).unwrap();

        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("POST /monitor/crawler/parseDealData "), "head: {}", head);
        assert!(head.to_ascii_lowercase().contains("crawler-code: gs-znzx-fd-crawler"));
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), payload);
    }

    #[test]
    fn test_success_false_is_downstream_error() {
        let (host, server) = one_shot_server("200 OK", r#"{"success":false}"#);
        let err = forwarder(host).forward(&json!({"task_id": "a_top"})).unwrap_err();
        let (head, _) = server.join().unwrap();
        assert!(head.starts_with("POST /monitor/crawler/parseTopData "));
        assert!(matches!(err, RelayError::Downstream(_)));
    }

    #[test]
    fn test_non_200_is_downstream_error() {
        let (host, server) = one_shot_server("500 Internal Server Error", r#"{"success":true}"#);
        let err = forwarder(host).forward(&json!({})).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, RelayError::Downstream(_)));
    }

    #[test]
    fn test_unreachable_host_is_downstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(forwarder(host).forward(&json!({})), Err(RelayError::Downstream(_))));
    }

    #[test]
    fn test_push_data_disabled_skips_the_call() {
        let mut settings = ForwarderSettings::new("http://127.0.0.1:9");
        settings.push_data = false;
        HttpForwarder::new(settings).unwrap().forward(&json!({"a": 1})).unwrap();
    }
}
