use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    types::{parse_hex_u64, JsonRpcRequest, JsonRpcResponse},
    upstream::{
        circuit_breaker::{CircuitBreaker, CircuitBreakerState},
        http_client::HttpClient,
    },
};

use super::errors::UpstreamError;

/// Counters describing how one physical URL has behaved.
#[derive(Debug, Default)]
struct EndpointStats {
    total_successes: u64,
    total_failures: u64,
    last_latency_ms: Option<u64>,
    last_error: Option<String>,
    last_block: Option<u64>,
}

/// Serializable view of an endpoint for status reporting. The URL is redacted to its origin
/// because provider URLs usually embed API keys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    pub url: String,
    pub circuit_breaker: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_block: Option<u64>,
}

/// One physical JSON-RPC URL of a provider.
pub struct UpstreamEndpoint {
    provider: Arc<str>,
    url: String,
    http_client: Arc<HttpClient>,
    circuit_breaker: CircuitBreaker,
    next_id: AtomicU64,
    stats: Mutex<EndpointStats>,
}

impl UpstreamEndpoint {
    #[must_use]
    pub fn new(
        provider: Arc<str>,
        url: impl Into<String>,
        http_client: Arc<HttpClient>,
        circuit_breaker: CircuitBreaker,
    ) -> Self {
        Self {
            provider,
            url: url.into(),
            http_client,
            circuit_breaker,
            next_id: AtomicU64::new(1),
            stats: Mutex::new(EndpointStats::default()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<str> {
        &self.provider
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns `true` if the circuit breaker lets a request through.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.circuit_breaker.can_execute()
    }

    /// Sends one JSON-RPC call and returns its `result`.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::CircuitBreakerOpen`] if the breaker is open
    /// - [`UpstreamError::InvalidResponse`] if the body is not a JSON-RPC response
    /// - [`UpstreamError::RpcError`] if the response carries an error object
    /// - transport errors from [`HttpClient::post_json`]
    pub async fn call(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        if !self.circuit_breaker.can_execute() {
            return Err(UpstreamError::CircuitBreakerOpen);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, Some(params.clone()), Value::from(id));
        let body = serde_json::to_vec(&request)
            .map_err(|e| UpstreamError::Call(format!("failed to serialize request: {e}")))?;

        tracing::debug!(
            provider = %self.provider,
            method = method,
            circuit_breaker = ?self.circuit_breaker.state(),
            "sending request to endpoint"
        );

        let started = Instant::now();
        let outcome = self.exchange(bytes::Bytes::from(body), timeout).await;
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.circuit_breaker.on_success();
                let mut stats = self.stats.lock();
                stats.total_successes += 1;
                stats.last_latency_ms = Some(latency_ms);
                Ok(result)
            }
            Err(error) => {
                if error.should_trip_breaker() {
                    self.circuit_breaker.on_failure();
                }
                let mut stats = self.stats.lock();
                stats.total_failures += 1;
                stats.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    async fn exchange(&self, body: bytes::Bytes, timeout: Duration) -> Result<Value, UpstreamError> {
        let raw = self.http_client.post_json(&self.url, body, timeout).await?;

        let response: JsonRpcResponse = serde_json::from_slice(&raw)
            .map_err(|e| UpstreamError::InvalidResponse(format!("invalid JSON-RPC body: {e}")))?;

        if let Some(error) = response.error {
            return Err(UpstreamError::RpcError(error.code, error.message));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Asks the endpoint for its head block.
    ///
    /// # Errors
    ///
    /// Returns the call error, or [`UpstreamError::InvalidResponse`] if the result is not a
    /// hex quantity.
    pub async fn probe(&self, timeout: Duration) -> Result<u64, UpstreamError> {
        let result = tokio::time::timeout(
            timeout,
            self.call("eth_blockNumber", &Value::Array(Vec::new()), timeout),
        )
        .await
        .map_err(|_| UpstreamError::Timeout)??;

        let block = parse_hex_u64(&result).ok_or_else(|| {
            UpstreamError::InvalidResponse(format!("eth_blockNumber returned {result}"))
        })?;
        self.stats.lock().last_block = Some(block);
        Ok(block)
    }

    #[must_use]
    pub fn status(&self) -> EndpointStatus {
        let stats = self.stats.lock();
        EndpointStatus {
            url: redact_url(&self.url),
            circuit_breaker: self.circuit_breaker.state(),
            consecutive_failures: self.circuit_breaker.failure_count(),
            total_successes: stats.total_successes,
            total_failures: stats.total_failures,
            last_latency_ms: stats.last_latency_ms,
            last_error: stats.last_error.clone(),
            last_block: stats.last_block,
        }
    }
}

/// Method-specific deadline: range scans and tracing calls get twice the base timeout.
#[must_use]
pub fn timeout_for_method(method: &str, base: Duration) -> Duration {
    if method == "eth_getLogs" || method.starts_with("debug_") || method.starts_with("trace_") {
        base.saturating_mul(2)
    } else {
        base
    }
}

/// Strips path, query and credentials so API keys never reach logs or snapshots.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}://{host}:{port}", parsed.scheme()),
            (Some(host), None) => format!("{}://{host}", parsed.scheme()),
            _ => parsed.scheme().to_string(),
        },
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(url: &str) -> UpstreamEndpoint {
        let client = Arc::new(HttpClient::new().expect("client should build"));
        UpstreamEndpoint::new(Arc::from("test"), url, client, CircuitBreaker::new(2, Duration::from_secs(60)))
    }

    #[test]
    fn test_redact_url_drops_api_keys() {
        assert_eq!(
            redact_url("https://eth-mainnet.g.alchemy.com/v2/SECRET"),
            "https://eth-mainnet.g.alchemy.com"
        );
        assert_eq!(redact_url("http://user:pw@127.0.0.1:8545/"), "http://127.0.0.1:8545");
        assert_eq!(redact_url("not a url"), "<invalid url>");
    }

    #[test]
    fn test_timeout_for_method() {
        let base = Duration::from_secs(5);
        assert_eq!(timeout_for_method("eth_getLogs", base), Duration::from_secs(10));
        assert_eq!(timeout_for_method("trace_block", base), Duration::from_secs(10));
        assert_eq!(timeout_for_method("eth_call", base), base);
    }

    #[tokio::test]
    async fn test_call_returns_result_and_probe_parses_head() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::Regex(r#""method"\s*:\s*"eth_blockNumber""#.into()))
            .with_status(200)
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x2a"}).to_string())
            .create_async()
            .await;

        let endpoint = endpoint(&server.url());
        assert_eq!(endpoint.probe(Duration::from_secs(2)).await.unwrap(), 42);

        let status = endpoint.status();
        assert_eq!(status.total_successes, 1);
        assert_eq!(status.last_block, Some(42));
        assert_eq!(status.circuit_breaker, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_without_tripping_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(
                json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "invalid params"}})
                    .to_string(),
            )
            .create_async()
            .await;

        let endpoint = endpoint(&server.url());
        for _ in 0..3 {
            let err = endpoint.call("eth_call", &json!([]), Duration::from_secs(2)).await.unwrap_err();
            assert!(matches!(err, UpstreamError::RpcError(-32602, _)));
        }
        assert_eq!(endpoint.status().circuit_breaker, CircuitBreakerState::Closed);
        assert_eq!(endpoint.status().total_failures, 3);
    }

    #[tokio::test]
    async fn test_server_errors_open_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/").with_status(502).create_async().await;

        let endpoint = endpoint(&server.url());
        for _ in 0..2 {
            let err = endpoint.call("eth_chainId", &json!([]), Duration::from_secs(2)).await.unwrap_err();
            assert!(matches!(err, UpstreamError::HttpError(502, _)));
        }

        assert!(!endpoint.is_available());
        let err = endpoint.call("eth_chainId", &json!([]), Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitBreakerOpen));
    }
}
