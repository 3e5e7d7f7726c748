use thiserror::Error;

/// Message fragments providers use when they throttle a caller without a dedicated status code.
const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "exceeded its compute units",
    "capacity",
    "throughput",
    "daily request count exceeded",
    "limit exceeded",
];

/// Classification of JSON-RPC error codes.
///
/// Decides whether a failed call should rotate to another endpoint, be retried after a
/// backoff, or be surfaced to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorCategory {
    /// Invalid request, method not found, invalid params. Never the provider's fault.
    ClientError,
    /// Internal or server-side failure at the provider.
    ProviderError,
    /// Throttling, either `-32005` or a throttling message in the server-error range.
    RateLimit,
    /// Upstream produced something that is not valid JSON-RPC.
    ParseError,
    /// Reverts, out of gas and nonce problems belong to the call, not the provider.
    ExecutionError,
}

impl RpcErrorCategory {
    /// Classifies a JSON-RPC error code together with its message.
    ///
    /// The `-32000..=-32099` range is shared by every provider for unrelated failures, so the
    /// message decides between execution errors, throttling and genuine provider faults.
    #[must_use]
    pub fn classify(code: i32, message: &str) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32602..=-32600 => Self::ClientError,
            -32005 => Self::RateLimit,
            -32603 => Self::ProviderError,
            // geth reports reverts with code 3 and the revert data attached
            3 => Self::ExecutionError,
            -32099..=-32000 => {
                let lower = message.to_lowercase();
                if mentions_rate_limit(&lower) {
                    Self::RateLimit
                } else if lower.contains("revert") ||
                    lower.contains("out of gas") ||
                    lower.contains("insufficient funds") ||
                    lower.contains("nonce too low") ||
                    lower.contains("gas too low")
                {
                    Self::ExecutionError
                } else {
                    Self::ProviderError
                }
            }
            _ if mentions_rate_limit(&message.to_lowercase()) => Self::RateLimit,
            _ => Self::ProviderError,
        }
    }

    /// Returns `true` if another attempt (elsewhere or later) may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError | Self::ParseError)
    }

    /// Returns `true` if the error counts against the provider's health.
    #[must_use]
    pub fn should_penalize_provider(&self) -> bool {
        matches!(self, Self::ProviderError | Self::ParseError)
    }

    /// Returns `true` if the error should count toward an endpoint circuit breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        matches!(self, Self::ProviderError | Self::ParseError)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::ProviderError => "provider_error",
            Self::RateLimit => "rate_limit",
            Self::ParseError => "parse_error",
            Self::ExecutionError => "execution_error",
        }
    }
}

fn mentions_rate_limit(lowercase_message: &str) -> bool {
    RATE_LIMIT_KEYWORDS.iter().any(|keyword| lowercase_message.contains(keyword))
}

/// Errors raised while talking to an upstream provider endpoint.
///
/// Executors handed to the strategy also return this type; [`UpstreamError::Call`] carries
/// failures that originate in caller code rather than in the transport.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded its deadline.
    #[error("Request timeout")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx HTTP status with a truncated body.
    #[error("HTTP error {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error object returned by the provider.
    #[error("RPC error {0}: {1}")]
    RpcError(i32, String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Every endpoint of the provider has an open circuit breaker.
    #[error("Circuit breaker is open")]
    CircuitBreakerOpen,

    /// The provider cannot be reached through this relay at all (no endpoint pool).
    /// Not the provider's fault, so it never affects provider health.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Failure raised by caller-supplied execution logic.
    #[error("{0}")]
    Call(String),
}

impl UpstreamError {
    /// Returns the RPC error category if this is an RPC error.
    #[must_use]
    pub fn rpc_category(&self) -> Option<RpcErrorCategory> {
        match self {
            Self::RpcError(code, message) => Some(RpcErrorCategory::classify(*code, message)),
            _ => None,
        }
    }

    /// Returns `true` for throttling: HTTP 429, RPC `-32005`, or a rate/capacity keyword.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::HttpError(429, _) => true,
            Self::HttpError(_, body) => mentions_rate_limit(&body.to_lowercase()),
            Self::RpcError(..) => self.rpc_category() == Some(RpcErrorCategory::RateLimit),
            Self::Call(message) => mentions_rate_limit(&message.to_lowercase()),
            _ => false,
        }
    }

    /// Returns `true` if retrying on another endpoint or after a delay may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout |
            Self::Network(_) |
            Self::ConnectionFailed(_) |
            Self::CircuitBreakerOpen |
            Self::ProviderUnavailable(_) |
            Self::InvalidResponse(_) => true,
            Self::HttpError(status, _) => (500..=599).contains(status) || self.is_rate_limited(),
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| cat.is_transient()),
            Self::Call(_) => self.is_rate_limited(),
        }
    }

    /// Returns `true` if the call itself is wrong and no endpoint or provider will accept it.
    ///
    /// Permanent errors skip the remaining retries for a provider and are surfaced directly.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::HttpError(status, _) => matches!(status, 400 | 413 | 422),
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| {
                matches!(cat, RpcErrorCategory::ClientError | RpcErrorCategory::ExecutionError)
            }),
            _ => false,
        }
    }

    /// Returns `true` if this failure should count against the provider's health.
    #[must_use]
    pub fn should_penalize_provider(&self) -> bool {
        if self.is_permanent() || self.is_rate_limited() {
            return false;
        }
        match self {
            Self::ProviderUnavailable(_) => false,
            Self::RpcError(..) => {
                self.rpc_category().is_some_and(|cat| cat.should_penalize_provider())
            }
            _ => true,
        }
    }

    /// Returns `true` if this failure should count toward the endpoint circuit breaker.
    #[must_use]
    pub fn should_trip_breaker(&self) -> bool {
        match self {
            Self::RpcError(..) => self.rpc_category().is_some_and(|cat| cat.should_trip_breaker()),
            Self::HttpError(status, _) => (500..=599).contains(status),
            Self::Timeout | Self::Network(_) | Self::ConnectionFailed(_) => true,
            Self::InvalidResponse(_) => true,
            _ => false,
        }
    }
}
