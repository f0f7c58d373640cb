//! HTTP-backed remote audio connection.
//!
//! Every `send` is one POST carrying the frame as base64 inline data. The audio found in
//! the response body is kept until the following `receive` picks it up.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::{audio_request_body, extract_inline_audio, RemoteAudioConnection, API_KEY_HEADER};
use crate::error::UpstreamError;

pub struct HttpAudioConnection {
    client: reqwest::Client,
    endpoint: String,
    api_key: Arc<str>,
    healthy: bool,
    pending: Option<Vec<u8>>,
}

impl HttpAudioConnection {
    pub fn new(client: reqwest::Client, endpoint: String, api_key: Arc<str>) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            healthy: true,
            pending: None,
        }
    }

    fn mark_unhealthy(&mut self) {
        self.healthy = false;
        self.pending = None;
    }
}

#[async_trait]
impl RemoteAudioConnection for HttpAudioConnection {
    async fn send(&mut self, audio: &[u8]) -> Result<(), UpstreamError> {
        if !self.healthy {
            return Err(UpstreamError::Unhealthy);
        }
        // A response nobody collected belongs to an earlier frame
        self.pending = None;

        let body = audio_request_body(audio);
        let sent = self
            .client
            .post(self.endpoint.as_str())
            .header(API_KEY_HEADER, self.api_key.as_ref())
            .json(&body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                self.mark_unhealthy();
                return Err(UpstreamError::Transport(err.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.mark_unhealthy();
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) if err.is_decode() => return Err(UpstreamError::Decode(err.to_string())),
            Err(err) => {
                self.mark_unhealthy();
                return Err(UpstreamError::Transport(err.to_string()));
            }
        };

        let reply = extract_inline_audio(&body)?;
        debug!(
            size = audio.len(),
            status = status.as_u16(),
            reply_size = reply.len(),
            "Audio sent to upstream"
        );
        self.pending = Some(reply);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, UpstreamError> {
        if !self.healthy {
            return Err(UpstreamError::Unhealthy);
        }

        match self.pending.take() {
            Some(audio) if !audio.is_empty() => Ok(audio),
            _ => Err(UpstreamError::NoResponse),
        }
    }

    async fn close(&mut self) -> Result<(), UpstreamError> {
        self.mark_unhealthy();
        info!("HTTP upstream connection closed");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}
