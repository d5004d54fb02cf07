//! Prometheus HTTP query adapter.
//!
//! Sends instant queries as `POST /api/v1/query` with a form-encoded body
//! over a plain HTTP/1 connection and reduces the response to a single
//! sample.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use tracing::debug;

use nodefleet_core::BoxFuture;

use crate::error::{MetricsError, MetricsResult};
use crate::source::MetricsSource;

/// [`MetricsSource`] backed by a Prometheus-compatible HTTP API.
///
/// Only `http://` endpoints are supported. Deadlines are applied by the
/// collector, not here.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    /// `host:port` to connect to.
    address: String,
    /// Path prefix ahead of `/api/v1/query`, without trailing slash.
    prefix: String,
}

impl PrometheusSource {
    /// Build a source from a base URL such as `http://10.0.0.5:30090`.
    pub fn new(base_url: &str) -> MetricsResult<Self> {
        let uri: http::Uri = base_url
            .parse()
            .map_err(|e| MetricsError::unavailable("prometheus_url", format!("invalid URL {base_url}: {e}")))?;

        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(MetricsError::unavailable(
                "prometheus_url",
                format!("unsupported scheme in {base_url}"),
            ));
        }

        let authority = uri
            .authority()
            .ok_or_else(|| MetricsError::unavailable("prometheus_url", format!("missing host in {base_url}")))?;
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };

        Ok(Self {
            address,
            prefix: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post_query(&self, expr: &str) -> MetricsResult<Option<f64>> {
        let path = format!("{}/api/v1/query", self.prefix);
        let uri = format!("http://{}{path}", self.address);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| MetricsError::unavailable(expr, format!("connect {}: {e}", self.address)))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| MetricsError::unavailable(expr, format!("handshake: {e}")))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let body = format!("query={}", urlencoding::encode(expr));
        let req = http::Request::builder()
            .method("POST")
            .uri(path.as_str())
            .header("host", &self.address)
            .header("user-agent", "nodefleet-metrics/0.1")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| MetricsError::unavailable(expr, format!("request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| MetricsError::unavailable(expr, format!("send: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MetricsError::unavailable(expr, format!("read body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            debug!(%status, %uri, "prometheus query non-2xx");
            return Err(MetricsError::unavailable(expr, format!("HTTP {status}")));
        }

        parse_query_response(expr, &bytes)
    }
}

impl MetricsSource for PrometheusSource {
    fn query<'a>(&'a self, expr: &'a str) -> BoxFuture<'a, MetricsResult<Option<f64>>> {
        Box::pin(self.post_query(expr))
    }
}

// ── Response parsing ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

/// Reduce an instant-query response body to its first sample.
///
/// Vector results yield the first element's value (empty vector → `None`).
/// Scalar results yield the scalar. Anything else is malformed.
pub fn parse_query_response(expr: &str, body: &[u8]) -> MetricsResult<Option<f64>> {
    let parsed: QueryResponse = serde_json::from_slice(body)
        .map_err(|e| MetricsError::malformed(expr, format!("invalid JSON: {e}")))?;

    if parsed.status != "success" {
        return Err(MetricsError::unavailable(
            expr,
            parsed.error.unwrap_or_else(|| format!("status {}", parsed.status)),
        ));
    }

    let data = parsed
        .data
        .ok_or_else(|| MetricsError::malformed(expr, "missing data"))?;

    let pair = match data.result_type.as_str() {
        "vector" => {
            let items = data
                .result
                .as_array()
                .ok_or_else(|| MetricsError::malformed(expr, "vector result is not an array"))?;
            match items.first() {
                Some(item) => item
                    .get("value")
                    .cloned()
                    .ok_or_else(|| MetricsError::malformed(expr, "vector sample missing value"))?,
                None => return Ok(None),
            }
        }
        "scalar" => data.result,
        other => {
            return Err(MetricsError::malformed(expr, format!("unsupported result type {other}")));
        }
    };

    sample_value(expr, &pair).map(Some)
}

/// Extract the value from a `[timestamp, "value"]` pair.
fn sample_value(expr: &str, pair: &serde_json::Value) -> MetricsResult<f64> {
    let raw = pair
        .as_array()
        .and_then(|p| p.get(1))
        .and_then(|v| v.as_str())
        .ok_or_else(|| MetricsError::malformed(expr, "sample is not a [ts, value] pair"))?;

    let value: f64 = raw
        .parse()
        .map_err(|_| MetricsError::malformed(expr, format!("sample value {raw:?} is not numeric")))?;

    if value.is_finite() {
        Ok(value)
    } else {
        Err(MetricsError::malformed(expr, format!("sample value {raw} is not finite")))
    }
}
