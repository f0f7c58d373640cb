//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every client session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every handler and session share the same pool, codec and counters
//! - **Why needed**: actix-web runs handlers on several worker threads at once
//!
//! ### Atomics instead of RwLock
//! - Counters are bumped on every audio frame, from many sessions at once
//! - `AtomicU64::fetch_add` never blocks, so a hot session cannot stall the others
//!
//! ### CancellationToken
//! - One root token per process; each session runs under a child token
//! - Cancelling the root on shutdown reaches every live session

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::codec::AudioProcessor;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::pool::ConnectionPool;
use crate::session::SessionContext;

/// The application state shared across all handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration, read-only after startup
    pub config: Arc<AppConfig>,

    /// The one upstream connection pool of this process
    pub pool: ConnectionPool,

    /// Client-edge codec settings shared by every session
    pub processor: Arc<AudioProcessor>,

    /// Gateway-wide counters
    pub metrics: Arc<GatewayMetrics>,

    /// Root cancellation scope; cancelled when the server drains
    pub shutdown: CancellationToken,

    /// When the server started
    pub start_time: Instant,
}

/// Gateway-wide counters, updated lock-free from every session.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    active_sessions: AtomicUsize,
    total_sessions: AtomicU64,
    failed_sessions: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    responses_sent: AtomicU64,
    upstream_failures: AtomicU64,
    pool_timeouts: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`], ready to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub responses_sent: u64,
    pub upstream_failures: u64,
    pub pool_timeouts: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl GatewayMetrics {
    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a session. Underflow is clamped at zero.
    pub fn session_closed(&self, failed: bool) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failed {
            self.failed_sessions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// One request frame answered, possibly over several client frames.
    pub fn response_sent(&self, bytes: usize) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn upstream_failed(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_timed_out(&self) {
        self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            failed_sessions: self.failed_sessions.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            pool_timeouts: self.pool_timeouts.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build the shared state around an already constructed pool.
    pub fn new(config: AppConfig, pool: ConnectionPool) -> Self {
        let processor = AudioProcessor::new(config.audio.client_encoding, config.audio.chunk_size);
        Self {
            config: Arc::new(config),
            pool,
            processor: Arc::new(processor),
            metrics: Arc::new(GatewayMetrics::default()),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    /// Everything a new session pipeline needs.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            pool: self.pool.clone(),
            processor: self.processor.clone(),
            config: self.config.session_config(),
            metrics: self.metrics.clone(),
        }
    }

    /// Decide whether one more client session may start.
    pub fn admit_session(&self) -> Result<(), AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::ShuttingDown);
        }
        let active = self.metrics.active_sessions();
        if active >= self.config.server.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "session limit of {} reached",
                self.config.server.max_sessions
            )));
        }
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
