use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

use crate::upstream::UpstreamError;

/// Largest slice of an error body kept in [`UpstreamError::HttpError`].
const MAX_ERROR_BODY: usize = 256;

/// Connection pool and concurrency settings for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of in-flight HTTP requests across all providers.
    pub concurrent_limit: usize,
    /// How long a request may wait for a concurrency permit.
    pub permit_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 256,
            permit_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client shared by every provider endpoint.
///
/// Retries are not done here: endpoint rotation and backoff live in the manager so that every
/// physical attempt is visible to the circuit breakers.
pub struct HttpClient {
    client: Client,
    permits: Arc<Semaphore>,
    config: HttpClientConfig,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_config(HttpClientConfig::default())
    }

    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .connect_timeout(config.connect_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("relay-core/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self { client, permits: Arc::new(Semaphore::new(config.concurrent_limit.max(1))), config })
    }

    /// Posts a JSON body and returns the raw response body of a 2xx reply.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::Timeout`] if no permit frees up in time or the request times out
    /// - [`UpstreamError::HttpError`] for non-success status codes
    /// - [`UpstreamError::ConnectionFailed`] for transport failures
    pub async fn post_json(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, UpstreamError> {
        let _permit = tokio::time::timeout(
            self.config.permit_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                url = url,
                available_permits = self.permits.available_permits(),
                "http client permit wait timed out"
            );
            UpstreamError::Timeout
        })?
        .map_err(|_| UpstreamError::ConnectionFailed("http client shut down".to_string()))?;

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return response.bytes().await.map_err(|e| classify_send_error(&e));
        }

        let text = response.text().await.unwrap_or_default();
        Err(UpstreamError::HttpError(status.as_u16(), truncate_body(text)))
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Maps a reqwest failure without leaking URLs or keys embedded in them.
fn classify_send_error(error: &reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        return UpstreamError::Timeout;
    }
    let reason = if error.is_connect() {
        "connection refused or unreachable"
    } else if error.is_body() || error.is_decode() {
        "response body error"
    } else if error.is_redirect() {
        "unexpected redirect"
    } else {
        "request failed"
    };
    UpstreamError::ConnectionFailed(reason.to_string())
}

fn truncate_body(mut text: String) -> String {
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("... (truncated)");
    }
    text
}
