//! Notification sinks for scaling events.
//!
//! Publishing is fire-and-forget from the cycle's point of view: the
//! orchestrator logs a failed publish and moves on.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use thiserror::Error;
use tracing::{debug, info};

use nodefleet_core::BoxFuture;
use nodefleet_state::ScalingEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Destination for scaling events.
pub trait NotificationSink: Send + Sync {
    fn publish<'a>(&'a self, event: &'a ScalingEvent) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish<'a>(&'a self, event: &'a ScalingEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            info!(
                cluster = %event.cluster_id,
                kind = event.kind.as_str(),
                delta = event.delta,
                reason = %event.reason,
                "scaling event"
            );
            Ok(())
        })
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ScalingEvent>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish fail after recording the event.
    pub fn fail_deliveries(&self) {
        self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, event: &ScalingEvent) -> Result<(), NotifyError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Delivery("sink configured to fail".into()));
        }
        Ok(())
    }
}

impl NotificationSink for RecordingSink {
    fn publish<'a>(&'a self, event: &'a ScalingEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move { self.record(event) })
    }
}

/// POSTs each event as JSON to an `http://` webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    address: String,
    path: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let invalid = |reason: &str| NotifyError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: http::Uri = url.parse().map_err(|_| invalid("unparseable"))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http:// is supported"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            address,
            path,
            timeout: Duration::from_secs(5),
        })
    }

    async fn post(&self, event: &ScalingEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(event)?;
        let uri = format!("http://{}{}", self.address, self.path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| NotifyError::Delivery(format!("connect {}: {e}", self.address)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Delivery(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(self.path.as_str())
            .header("host", &self.address)
            .header("user-agent", "nodefleet/0.1")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NotifyError::Delivery(format!("request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Delivery(format!("send: {e}")))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Delivery(format!("HTTP {}", resp.status())));
        }
        debug!(%uri, kind = event.kind.as_str(), "webhook delivered");
        Ok(())
    }
}

impl NotificationSink for WebhookSink {
    fn publish<'a>(&'a self, event: &'a ScalingEvent) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.post(event))
                .await
                .map_err(|_| NotifyError::Delivery(format!("timed out after {:?}", self.timeout)))?
        })
    }
}
