use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::types::parse_hex_u64;

use super::{errors::UpstreamError, subscription::stopped};

/// What a text frame on a `newHeads` stream carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadMessage {
    /// Reply to `eth_subscribe` carrying the subscription id.
    Confirmed(String),
    /// A new head block number.
    Head(u64),
    Other,
}

/// Parses one text frame of a `newHeads` subscription.
#[must_use]
pub fn parse_head_message(text: &str) -> HeadMessage {
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        return HeadMessage::Other;
    };

    if let Some(Value::String(id)) = json.get("result") {
        return HeadMessage::Confirmed(id.clone());
    }

    json.get("params")
        .and_then(|params| params.get("result"))
        .and_then(|head| head.get("number"))
        .and_then(parse_hex_u64)
        .map_or(HeadMessage::Other, HeadMessage::Head)
}

/// Checks that `url` is a `ws://` or `wss://` URL.
///
/// # Errors
///
/// Returns [`UpstreamError::InvalidResponse`] describing the problem.
pub fn validate_ws_url(url: &str) -> Result<&str, UpstreamError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(UpstreamError::InvalidResponse("WebSocket URL is empty".to_string()));
    }
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(UpstreamError::InvalidResponse(format!(
            "Invalid WebSocket URL format: {}",
            super::endpoint::redact_url(url)
        )));
    }
    Ok(url)
}

/// Streams `newHeads` from one WebSocket endpoint into `on_head` until `stop` is set.
///
/// Returns `Ok(())` only when stopped; a closed or failed stream is an error so the caller
/// can move on to another source.
///
/// # Errors
///
/// Returns [`UpstreamError::ConnectionFailed`] if the connection cannot be established, the
/// subscription cannot be sent, or the stream ends.
pub async fn stream_new_heads<F>(
    provider: &str,
    url: &str,
    stop: &mut watch::Receiver<bool>,
    on_head: &mut F,
) -> Result<(), UpstreamError>
where
    F: FnMut(u64),
{
    let url = validate_ws_url(url)?;
    tracing::info!(provider = provider, url = %super::endpoint::redact_url(url), "connecting to websocket");

    let (ws_stream, response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
        tracing::warn!(provider = provider, error = %e, "websocket connection failed");
        connect_error(provider, &e.to_string())
    })?;
    tracing::info!(
        provider = provider,
        status = response.status().as_u16(),
        "websocket connected"
    );

    let (mut write, mut read) = ws_stream.split();
    let subscribe = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["newHeads"]
    });
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await
        .map_err(|e| UpstreamError::ConnectionFailed(format!("WebSocket send error: {e}")))?;

    loop {
        tokio::select! {
            () = stopped(stop) => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_head_message(&text) {
                    HeadMessage::Confirmed(id) => {
                        tracing::info!(provider = provider, subscription = %id, "subscribed to newHeads");
                    }
                    HeadMessage::Head(block) => {
                        tracing::debug!(provider = provider, block = block, "new head");
                        on_head(block);
                    }
                    HeadMessage::Other => {
                        tracing::debug!(provider = provider, message = text.as_str(), "ignored websocket message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!(provider = provider, "websocket connection closed");
                    return Err(UpstreamError::ConnectionFailed("WebSocket closed".to_string()));
                }
                Some(Err(e)) => {
                    tracing::warn!(provider = provider, error = %e, "websocket error");
                    return Err(UpstreamError::ConnectionFailed(format!("WebSocket error: {e}")));
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn connect_error(provider: &str, message: &str) -> UpstreamError {
    if message.contains("HTTP error: 200 OK") {
        UpstreamError::ConnectionFailed(format!(
            "{provider} returned 200 OK but does not speak WebSocket"
        ))
    } else if message.contains("HTTP error: 403") {
        UpstreamError::ConnectionFailed(format!("WebSocket access forbidden for {provider}"))
    } else {
        UpstreamError::ConnectionFailed(format!("WebSocket connection failed: {message}"))
    }
}
