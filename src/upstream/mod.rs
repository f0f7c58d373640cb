//! # Remote Audio Connections
//!
//! A remote audio connection is one logical channel to the upstream speech API. The pool
//! and the session pipeline only ever see the [`RemoteAudioConnection`] trait, so the
//! wire binding can change without touching either of them.
//!
//! ## Contract:
//! - `send` delivers one audio payload
//! - `receive` blocks until the response payload for that send is available, or fails
//! - transport failures and non-success statuses mark the connection unhealthy
//! - once unhealthy, a connection never reports healthy again; it gets replaced
//! - a connection is owned by exactly one session at a time (`&mut self`)
//!
//! ## Bindings:
//! - **http**: one HTTPS JSON request per frame (`http.rs`)
//! - **websocket**: a long-lived socket per connection (`websocket.rs`)

pub mod http;
pub mod websocket;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, UpstreamTransport};
use crate::error::UpstreamError;

pub use self::http::HttpAudioConnection;
pub use self::websocket::WebSocketAudioConnection;

/// Header carrying the API key on every upstream request.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// One channel to the upstream speech service.
#[async_trait]
pub trait RemoteAudioConnection: Send + Sync {
    /// Send one audio payload upstream.
    async fn send(&mut self, audio: &[u8]) -> Result<(), UpstreamError>;

    /// Wait for the response payload of the preceding `send`.
    async fn receive(&mut self) -> Result<Vec<u8>, UpstreamError>;

    /// Release the underlying resources. The connection is unhealthy afterwards.
    async fn close(&mut self) -> Result<(), UpstreamError>;

    fn is_healthy(&self) -> bool;
}

/// Opens new remote audio connections on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn RemoteAudioConnection>, UpstreamError>;
}

/// Builds connections for the binding selected in the configuration.
///
/// All HTTP connections share one `reqwest::Client` (and so its connection pool
/// and TLS sessions); each WebSocket connection owns its socket.
pub struct UpstreamFactory {
    transport: UpstreamTransport,
    endpoint: String,
    api_key: Arc<str>,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl UpstreamFactory {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            transport: config.upstream.transport,
            endpoint: config.upstream.endpoint.clone(),
            api_key: Arc::from(config.upstream.api_key.as_str()),
            request_timeout: config.request_timeout(),
            client,
        })
    }
}

#[async_trait]
impl ConnectionFactory for UpstreamFactory {
    async fn create(&self) -> Result<Box<dyn RemoteAudioConnection>, UpstreamError> {
        match self.transport {
            UpstreamTransport::Http => Ok(Box::new(HttpAudioConnection::new(
                self.client.clone(),
                self.endpoint.clone(),
                self.api_key.clone(),
            ))),
            UpstreamTransport::Websocket => Ok(Box::new(WebSocketAudioConnection::new(
                self.endpoint.clone(),
                self.api_key.clone(),
                self.request_timeout,
            ))),
        }
    }
}

/// Request body carrying one frame of PCM audio as inline data.
pub(crate) fn audio_request_body(audio: &[u8]) -> Value {
    json!({
        "contents": [{
            "parts": [{
                "inline_data": {
                    "mime_type": "audio/pcm",
                    "data": STANDARD.encode(audio),
                }
            }]
        }]
    })
}

/// Collect every inline audio part of a response, in order.
///
/// Accepts a single response object or an array of streamed chunks, and both the
/// camelCase (`inlineData`) and snake_case (`inline_data`) spellings.
pub(crate) fn extract_inline_audio(body: &Value) -> Result<Vec<u8>, UpstreamError> {
    let chunks: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut audio = Vec::new();
    for chunk in chunks {
        let candidates = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for candidate in candidates {
            let parts = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for part in parts {
                let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
                if let Some(data) = inline.and_then(|i| i.get("data")).and_then(Value::as_str) {
                    let decoded = STANDARD
                        .decode(data)
                        .map_err(|e| UpstreamError::Decode(e.to_string()))?;
                    audio.extend_from_slice(&decoded);
                }
            }
        }
    }

    Ok(audio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_carries_base64_audio() {
        let body = audio_request_body(&[1, 2, 3]);
        let data = body
            .pointer("/contents/0/parts/0/inline_data/data")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(data, "AQID");
        assert_eq!(
            body.pointer("/contents/0/parts/0/inline_data/mime_type"),
            Some(&json!("audio/pcm"))
        );
    }

    #[test]
    fn test_extract_inline_audio_from_stream_chunks() {
        let body = json!([
            {"candidates": [{"content": {"parts": [
                {"text": "ignored"},
                {"inlineData": {"mimeType": "audio/pcm", "data": "AQI="}}
            ]}}]},
            {"candidates": [{"content": {"parts": [
                {"inline_data": {"mime_type": "audio/pcm", "data": "Aw=="}}
            ]}}]}
        ]);
        assert_eq!(extract_inline_audio(&body).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_extract_inline_audio_without_audio() {
        let body = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]});
        assert!(extract_inline_audio(&body).unwrap().is_empty());
        assert!(extract_inline_audio(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_extract_inline_audio_rejects_bad_base64() {
        let body = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"data": "!!not base64!!"}}
        ]}}]});
        assert!(matches!(extract_inline_audio(&body), Err(UpstreamError::Decode(_))));
    }

    #[tokio::test]
    async fn test_factory_follows_transport_setting() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "key".to_string();

        let factory = UpstreamFactory::from_config(&config).unwrap();
        let conn = factory.create().await.unwrap();
        assert!(conn.is_healthy());

        config.upstream.transport = UpstreamTransport::Websocket;
        config.upstream.endpoint = "ws://127.0.0.1:9/live".to_string();
        let factory = UpstreamFactory::from_config(&config).unwrap();
        let conn = factory.create().await.unwrap();
        assert!(conn.is_healthy());
    }
}
