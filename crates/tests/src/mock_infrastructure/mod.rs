//! Mock Infrastructure for Testing the relay
//!
//! Reusable fake providers so routing, quota and subscription behavior can be tested
//! without network access.
//!
//! - `RpcMockBuilder`: a mockito server scripted per JSON-RPC method
//! - `MockWebSocketServer`: a `newHeads` stream
//! - `fixtures`: a fully wired tracker, strategy and manager over mock providers
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::RpcMockBuilder;
//!
//! let mut mock = RpcMockBuilder::new().await;
//! mock.mock_block_number(100);
//!
//! // Use mock.url() as a provider rpc url
//! ```

pub mod fixtures;
pub mod rpc_mock;
pub mod websocket_mock;

pub use fixtures::{eventually, fast_manager_config, provider, RelayHarness};
pub use rpc_mock::{LogResponseBuilder, RpcMockBuilder};
pub use websocket_mock::MockWebSocketServer;
