//! Mock WebSocket provider for `newHeads` subscription tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Serves queued frames to every client and records what clients send.
pub struct MockWebSocketServer {
    addr: SocketAddr,
    outbox: Arc<RwLock<VecDeque<Message>>>,
    received: Arc<RwLock<Vec<String>>>,
    server_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockWebSocketServer {
    /// Binds to a random local port.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn new() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let outbox = Arc::new(RwLock::new(VecDeque::new()));
        let received = Arc::new(RwLock::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let accept_outbox = Arc::clone(&outbox);
        let accept_received = Arc::clone(&received);
        let server_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            tokio::spawn(Self::serve(
                                stream,
                                Arc::clone(&accept_outbox),
                                Arc::clone(&accept_received),
                            ));
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(Self { addr, outbox, received, server_handle, shutdown_tx })
    }

    async fn serve(
        stream: TcpStream,
        outbox: Arc<RwLock<VecDeque<Message>>>,
        received: Arc<RwLock<Vec<String>>>,
    ) {
        let Ok(ws_stream) = accept_async(stream).await else { return };
        let (mut write, mut read) = ws_stream.split();

        loop {
            {
                let mut queue = outbox.write().await;
                while let Some(msg) = queue.pop_front() {
                    if write.send(msg).await.is_err() {
                        return;
                    }
                }
            }

            tokio::select! {
                Some(result) = read.next() => match result {
                    Ok(Message::Text(text)) => received.write().await.push(text.to_string()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                },
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn enqueue_text(&self, text: impl Into<String>) {
        self.outbox.write().await.push_back(Message::Text(text.into().into()));
    }

    pub async fn send_subscription_confirmation(&self, subscription_id: &str) {
        let msg = json!({ "jsonrpc": "2.0", "id": 1, "result": subscription_id });
        self.enqueue_text(msg.to_string()).await;
    }

    /// Queues an `eth_subscription` notification carrying head `block_number`.
    pub async fn send_new_head(&self, block_number: u64) {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x9ce59a13059e417087c02d3236a0b9cc",
                "result": {
                    "number": format!("0x{block_number:x}"),
                    "hash": format!("0x{block_number:064x}"),
                    "parentHash": format!("0x{:064x}", block_number.saturating_sub(1)),
                }
            }
        });
        self.enqueue_text(msg.to_string()).await;
    }

    pub async fn send_close(&self) {
        self.outbox.write().await.push_back(Message::Close(None));
    }

    /// Polls until a client has sent `eth_subscribe` or `timeout` passes.
    pub async fn wait_for_subscription(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.received.read().await.iter().any(|msg| msg.contains("eth_subscribe")) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.received.read().await.clone()
    }
}

impl Drop for MockWebSocketServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.server_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_queued_head_reaches_client() {
        let server = MockWebSocketServer::new().await.unwrap();
        server.send_new_head(1000).await;

        let (mut ws_stream, _) = connect_async(server.url()).await.expect("Failed to connect");
        let frame = tokio::time::timeout(Duration::from_secs(2), ws_stream.next())
            .await
            .expect("no frame")
            .expect("stream ended")
            .expect("bad frame");

        let Message::Text(text) = frame else { panic!("Expected text message") };
        assert!(text.as_str().contains("eth_subscription"));
        assert!(text.as_str().contains("0x3e8"));
    }

    #[tokio::test]
    async fn test_records_client_messages() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws_stream, _) = connect_async(server.url()).await.expect("Failed to connect");

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        ws_stream.send(Message::Text(request.to_string().into())).await.unwrap();

        assert!(server.wait_for_subscription(Duration::from_secs(2)).await);
    }
}
