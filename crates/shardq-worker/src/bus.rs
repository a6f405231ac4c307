//! Downstream message bus adapters.
//!
//! The bus is at-least-once: a publish that reports failure is retried on a
//! later publisher cycle, and a publish that succeeded may still be repeated
//! if the follow-up delete fails. Consumers de-duplicate on `key`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::BusError;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Hand one message to the bus. `Ok` means the bus confirmed receipt.
    async fn publish(&self, key: &str, payload: &str) -> Result<(), BusError>;
}

/// Bus that only writes each message to the log.
#[derive(Debug, Clone)]
pub struct LogBus {
    topic: String,
}

impl LogBus {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl MessageBus for LogBus {
    async fn publish(&self, key: &str, payload: &str) -> Result<(), BusError> {
        info!(topic = %self.topic, key, payload, "outbox message published");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    topic: &'a str,
    key: &'a str,
    payload: &'a str,
}

/// Bus that POSTs each message as JSON `{topic, key, payload}` to a URL.
/// Any non-2xx response counts as a failed publish.
pub struct WebhookBus {
    client: reqwest::Client,
    url: String,
    topic: String,
    timeout: Duration,
}

impl WebhookBus {
    pub fn new(url: impl Into<String>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            topic: topic.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MessageBus for WebhookBus {
    async fn publish(&self, key: &str, payload: &str) -> Result<(), BusError> {
        let body = WebhookMessage {
            topic: &self.topic,
            key,
            payload,
        };
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BusError::Timeout {
                        ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    BusError::Http(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BusError::PublishFailed(format!(
                "webhook returned {status} for key {key}"
            )));
        }
        debug!(key, %status, "webhook accepted message");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    published: Vec<(String, String)>,
    fail_next: usize,
    failing: bool,
}

/// Bus that keeps every published message in memory, with failure
/// injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    state: Mutex<InMemoryState>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next = n;
        }
    }

    /// Fail every publish until switched off again.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.failing = failing;
        }
    }

    /// `(key, payload)` of every successful publish, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().map(|s| s.published.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, key: &str, payload: &str) -> Result<(), BusError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::PublishFailed("bus state poisoned".into()))?;
        if state.failing {
            return Err(BusError::PublishFailed(format!("bus down, key {key}")));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BusError::PublishFailed(format!("injected failure, key {key}")));
        }
        state.published.push((key.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_records_and_injects_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next(1);
        assert!(bus.publish("a", "1").await.is_err());
        bus.publish("a", "1").await.unwrap();

        bus.set_failing(true);
        assert!(bus.publish("b", "2").await.is_err());
        bus.set_failing(false);
        bus.publish("b", "2").await.unwrap();

        assert_eq!(
            bus.published(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }

    #[tokio::test]
    async fn log_bus_always_succeeds() {
        assert!(LogBus::new("topic").publish("k", "{}").await.is_ok());
    }

    /// One-shot HTTP endpoint answering every request with `status`.
    /// Returns its URL and a handle yielding the request body it received.
    async fn webhook_endpoint(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len || n == 0 {
                        break text[end + 4..].to_string();
                    }
                }
            };
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            body
        });
        (url, handle)
    }

    #[tokio::test]
    async fn webhook_posts_topic_key_and_payload() {
        let (url, received) = webhook_endpoint("204 No Content").await;
        let bus = WebhookBus::new(url, "scheduler-events", Duration::from_secs(5));

        bus.publish("event-1", r#"{"n":1}"#).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&received.await.unwrap()).unwrap();
        assert_eq!(body["topic"], "scheduler-events");
        assert_eq!(body["key"], "event-1");
        assert_eq!(body["payload"], r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn webhook_non_success_status_is_a_failed_publish() {
        let (url, received) = webhook_endpoint("503 Service Unavailable").await;
        let bus = WebhookBus::new(url, "scheduler-events", Duration::from_secs(5));

        let err = bus.publish("event-2", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::PublishFailed(ref msg) if msg.contains("503")));
        received.await.unwrap();
    }
}
