//! WebSocket-backed remote audio connection.
//!
//! Connects lazily on the first `send`, then keeps the socket for the lifetime of the
//! pooled connection. Audio goes out as binary frames; a response is the next binary
//! frame, or a text frame whose JSON carries inline audio.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{extract_inline_audio, RemoteAudioConnection, API_KEY_HEADER};
use crate::error::UpstreamError;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketAudioConnection {
    url: String,
    api_key: Arc<str>,
    response_timeout: Duration,
    socket: Option<UpstreamSocket>,
    healthy: bool,
}

impl WebSocketAudioConnection {
    pub fn new(url: String, api_key: Arc<str>, response_timeout: Duration) -> Self {
        Self {
            url,
            api_key,
            response_timeout,
            socket: None,
            healthy: true,
        }
    }

    fn fail(&mut self, err: UpstreamError) -> UpstreamError {
        self.healthy = false;
        self.socket = None;
        err
    }

    async fn connect(&self) -> Result<UpstreamSocket, UpstreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        request.headers_mut().insert(API_KEY_HEADER, key);

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        info!(url = %self.url, status = response.status().as_u16(), "Upstream WebSocket connected");
        Ok(socket)
    }

    async fn next_audio(socket: &mut UpstreamSocket) -> Result<Vec<u8>, UpstreamError> {
        while let Some(message) = socket.next().await {
            match message.map_err(|e| UpstreamError::Transport(e.to_string()))? {
                Message::Binary(audio) => return Ok(audio),
                Message::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| UpstreamError::Decode(e.to_string()))?;
                    let audio = extract_inline_audio(&value)?;
                    if !audio.is_empty() {
                        return Ok(audio);
                    }
                    debug!("Skipping upstream text frame without audio");
                }
                Message::Close(frame) => {
                    debug!(?frame, "Upstream closed the socket");
                    return Err(UpstreamError::Closed);
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Err(UpstreamError::Closed)
    }
}

#[async_trait]
impl RemoteAudioConnection for WebSocketAudioConnection {
    async fn send(&mut self, audio: &[u8]) -> Result<(), UpstreamError> {
        if !self.healthy {
            return Err(UpstreamError::Unhealthy);
        }

        if self.socket.is_none() {
            match self.connect().await {
                Ok(socket) => self.socket = Some(socket),
                Err(err) => return Err(self.fail(err)),
            }
        }

        let result = match self.socket.as_mut() {
            Some(socket) => socket.send(Message::Binary(audio.to_vec())).await,
            None => return Err(UpstreamError::Closed),
        };

        match result {
            Ok(()) => {
                debug!(size = audio.len(), "Audio sent to upstream socket");
                Ok(())
            }
            Err(err) => Err(self.fail(UpstreamError::Transport(err.to_string()))),
        }
    }

    async fn receive(&mut self) -> Result<Vec<u8>, UpstreamError> {
        if !self.healthy {
            return Err(UpstreamError::Unhealthy);
        }

        let timeout = self.response_timeout;
        let result = match self.socket.as_mut() {
            Some(socket) => tokio::time::timeout(timeout, Self::next_audio(socket)).await,
            None => return Err(UpstreamError::NoResponse),
        };

        match result {
            Ok(Ok(audio)) => Ok(audio),
            // A malformed payload does not say anything about the socket
            Ok(Err(UpstreamError::Decode(msg))) => Err(UpstreamError::Decode(msg)),
            Ok(Err(err)) => Err(self.fail(err)),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Upstream response timed out");
                Err(self.fail(UpstreamError::Transport("response timed out".to_string())))
            }
        }
    }

    async fn close(&mut self) -> Result<(), UpstreamError> {
        self.healthy = false;
        if let Some(mut socket) = self.socket.take() {
            socket
                .close(None)
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        }
        info!("WebSocket upstream connection closed");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}
