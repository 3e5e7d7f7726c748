//! RPC Mock Builder for metered provider testing
//!
//! Wraps mockito so each test can stand up one fake provider per server and script the
//! answers it gives per JSON-RPC method.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

fn method_matcher(method: &str) -> Matcher {
    Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
}

fn result_body(result: &Value) -> String {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
}

/// One fake provider endpoint.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl RpcMockBuilder {
    /// Creates a new RPC mock builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// Returns the URL of the mock server.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Mocks `eth_blockNumber`. Also answers the startup probe.
    pub fn mock_block_number(&mut self, block_number: u64) -> &mut Self {
        self.mock_method("eth_blockNumber", &json!(format!("0x{block_number:x}")))
    }

    /// Mocks `eth_getLogs` for one exact block range.
    pub fn mock_get_logs_for_range(
        &mut self,
        from_block: u64,
        to_block: u64,
        logs: &[Value],
    ) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                method_matcher("eth_getLogs"),
                Matcher::Regex(format!(r#""fromBlock"\s*:\s*"0x{from_block:x}""#)),
                Matcher::Regex(format!(r#""toBlock"\s*:\s*"0x{to_block:x}""#)),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(result_body(&json!(logs)))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a generic JSON-RPC method with a fixed result.
    pub fn mock_method(&mut self, method: &str, result: &Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(result_body(result))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a method that must be called exactly `hits` times; checked by [`Self::assert_all`].
    pub fn mock_method_times(&mut self, method: &str, result: &Value, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(result_body(result))
            .expect(hits)
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks an RPC error response.
    pub fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": code, "message": message }
                })
                .to_string(),
            )
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks an HTTP 500 for one method.
    pub fn mock_server_error(&mut self, method: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(500)
            .with_body("Internal Server Error")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks an HTTP 429 for one method.
    pub fn mock_rate_limited(&mut self, method: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(429)
            .with_body("Too Many Requests")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Returns a reference to the underlying mockito server for advanced mocking.
    pub fn get_server(&mut self) -> &mut ServerGuard {
        &mut self.server
    }

    /// Verifies all mocks were called.
    #[must_use]
    pub fn verify_all_called(&self) -> bool {
        self.mocks.iter().all(Mock::matched)
    }

    /// Panics unless every mock saw its expected number of hits.
    pub fn assert_all(&self) {
        for mock in &self.mocks {
            mock.assert();
        }
    }
}

/// Builder for constructing log responses.
pub struct LogResponseBuilder {
    address: String,
    block_number: u64,
    log_index: u64,
    topics: Vec<String>,
    data: String,
}

impl LogResponseBuilder {
    #[must_use]
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            address: "0x0000000000000000000000000000000000000001".to_string(),
            block_number,
            log_index,
            topics: vec![format!("0x{:064x}", 0)],
            data: "0x".to_string(),
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    #[must_use]
    pub fn build(self) -> Value {
        json!({
            "address": self.address,
            "blockNumber": format!("0x{:x}", self.block_number),
            "blockHash": format!("0x{:064x}", self.block_number),
            "logIndex": format!("0x{:x}", self.log_index),
            "transactionHash": format!("0x{:064x}", self.block_number * 100 + self.log_index),
            "transactionIndex": "0x0",
            "topics": self.topics,
            "data": self.data,
            "removed": false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rpc_mock_builder_creation() {
        let mock = RpcMockBuilder::new().await;
        assert!(mock.url().starts_with("http://"));
    }

    #[test]
    fn test_log_response_builder() {
        let log = LogResponseBuilder::new(100, 5)
            .with_address("0x1234567890abcdef1234567890abcdef12345678")
            .build();
        assert_eq!(log["blockNumber"], "0x64");
        assert_eq!(log["logIndex"], "0x5");
        assert_eq!(log["address"], "0x1234567890abcdef1234567890abcdef12345678");
    }
}
