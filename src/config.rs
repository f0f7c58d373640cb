//! # Configuration Management
//!
//! This module handles loading the gateway configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with the `APP__` prefix (`APP__POOL__MAX_SIZE=20`)
//! - The plain environment names the gateway has always been deployed with
//!   (`GEMINI_API_KEY`, `CONNECTION_POOL_SIZE`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Legacy environment names (GEMINI_API_KEY, SERVER_PORT, PORT, ...)
//! 2. Environment variables (APP__SERVER__PORT, APP__UPSTREAM__ENDPOINT, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::collections::HashMap;
use std::env;                    // For reading environment variables
use std::time::Duration;

use crate::audio::codec::AudioEncoding;
use crate::session::SessionConfig;

/// Default upstream endpoint: Gemini streaming content generation.
pub const DEFAULT_UPSTREAM_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:streamGenerateContent";

/// Main gateway configuration.
///
/// ## Why separate config structs:
/// Each group maps to one component (HTTP server, upstream binding, pool, codec,
/// session pipeline), so each component only receives the part it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub audio: AudioSettings,
    pub session: SessionSettings,
    pub logging: LoggingConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address to bind (e.g., "0.0.0.0" to accept from anywhere)
/// - `port`: TCP port number to listen on
/// - `max_sessions`: Client sessions allowed at once; further upgrades get a 503
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
}

/// Which wire binding the pool opens towards the speech API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamTransport {
    /// One HTTPS JSON request per audio frame
    Http,
    /// A long-lived WebSocket per pooled connection
    Websocket,
}

/// Remote speech API settings.
///
/// ## Fields:
/// - `api_key`: Sent as `x-goog-api-key`; required, startup fails without it
/// - `endpoint`: URL of the speech API (https:// for HTTP, wss:// for WebSocket)
/// - `transport`: Which binding to use
/// - `request_timeout_secs`: Upper bound for one upstream round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub endpoint: String,
    pub transport: UpstreamTransport,
    pub request_timeout_secs: u64,
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
}

/// Audio format handling at the client edge.
///
/// ## Fields:
/// - `chunk_size`: Largest binary frame written back to a client
/// - `client_encoding`: `pcm16` (pass-through) or `mulaw` (G.711 both ways)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub chunk_size: usize,
    pub client_encoding: AudioEncoding,
}

/// Per-session pipeline timings and queue size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Verbosity for this crate's own logs ("debug", "info", "warn", ...)
    pub level: String,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the gateway can start with nothing but an API key.
/// They also document the timings the session pipeline is tuned for.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                max_sessions: 1000,
            },
            upstream: UpstreamConfig {
                api_key: String::new(),                // Must be provided
                endpoint: DEFAULT_UPSTREAM_ENDPOINT.to_string(),
                transport: UpstreamTransport::Http,
                request_timeout_secs: 30,
            },
            pool: PoolConfig {
                max_size: 10,
                acquire_timeout_ms: 5_000,             // Bounded wait before a frame is dropped
            },
            audio: AudioSettings {
                chunk_size: 8192,
                client_encoding: AudioEncoding::Pcm16,
            },
            session: SessionSettings {
                queue_capacity: 10,
                ping_interval_secs: 54,                // Must stay below read_timeout_secs
                write_timeout_secs: 10,
                read_timeout_secs: 60,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with `APP__`
    /// 4. Override with the legacy environment names
    ///
    /// ## Environment Variable Examples:
    /// - `APP__POOL__MAX_SIZE=20`: Override pool size
    /// - `APP__AUDIO__CLIENT_ENCODING=mulaw`: Accept μ-law from clients
    /// - `GEMINI_API_KEY=...`: The API key
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::load_from("config", vars)
    }

    /// Same layering as [`AppConfig::load`], reading `file` and the given variables
    /// instead of `config.toml` and the process environment.
    fn load_from(file: &str, vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name(file).required(false))
            // 3. Load from environment variables, double underscore between levels
            // so that field names with underscores survive (APP__POOL__MAX_SIZE)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .source(Some(vars.clone())),
            );

        // 4. Names used by existing deployments
        for (var, key) in LEGACY_ENV_OVERRIDES {
            if let Some(value) = vars.get(*var) {
                if !value.is_empty() {
                    settings = settings.set_override(*key, value.as_str())?;
                }
            }
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The upstream API key is present (a missing key is fatal at startup)
    /// - Port, pool size, chunk size, queue capacity and session limit are non-zero
    /// - The keepalive ping fires before the read deadline expires, otherwise
    ///   every idle client would time out before its pong could arrive
    pub fn validate(&self) -> Result<()> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("GEMINI_API_KEY is required"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_sessions == 0 {
            return Err(anyhow::anyhow!("Max sessions must be greater than 0"));
        }

        if self.pool.max_size == 0 {
            return Err(anyhow::anyhow!("Connection pool size must be greater than 0"));
        }

        if self.audio.chunk_size == 0 {
            return Err(anyhow::anyhow!("Audio chunk size must be greater than 0"));
        }

        if self.session.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Session queue capacity must be greater than 0"));
        }

        if self.session.ping_interval_secs >= self.session.read_timeout_secs {
            return Err(anyhow::anyhow!(
                "Ping interval ({}s) must be shorter than the read timeout ({}s)",
                self.session.ping_interval_secs,
                self.session.read_timeout_secs
            ));
        }

        Ok(())  // All validation passed
    }

    /// Bounded wait used by the pool when no connection is free.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }

    /// Timings handed to every session pipeline.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.session.queue_capacity,
            ping_interval: Duration::from_secs(self.session.ping_interval_secs),
            write_timeout: Duration::from_secs(self.session.write_timeout_secs),
            read_timeout: Duration::from_secs(self.session.read_timeout_secs),
        }
    }

    /// Filter directive for tracing when RUST_LOG is not set.
    pub fn log_filter(&self) -> String {
        format!("voice_gateway={},actix_web=info", self.logging.level)
    }
}

/// Environment names from earlier deployments and the config key each one sets.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("SERVER_PORT", "server.port"),
    ("PORT", "server.port"),
    ("MAX_CONNECTIONS", "server.max_sessions"),
    ("GEMINI_API_KEY", "upstream.api_key"),
    ("GEMINI_API_ENDPOINT", "upstream.endpoint"),
    ("UPSTREAM_TRANSPORT", "upstream.transport"),
    ("CONNECTION_POOL_SIZE", "pool.max_size"),
    ("AUDIO_BUFFER_SIZE", "audio.chunk_size"),
    ("CLIENT_AUDIO_ENCODING", "audio.client_encoding"),
    ("LOG_LEVEL", "logging.level"),
];
