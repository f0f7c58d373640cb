//! In-memory upstream used by the pool and session tests.
//!
//! `MockConnection` echoes every payload back, can be told to fail
//! on specific payloads, and can be flipped unhealthy from the outside. `MockFactory`
//! counts what it created and what got closed so tests can check for leaks.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ConnectionFactory, RemoteAudioConnection};
use crate::error::UpstreamError;

#[derive(Default)]
pub struct MockStats {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub sends: AtomicUsize,
}

impl MockStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

pub struct MockConnection {
    healthy: Arc<AtomicBool>,
    stats: Arc<MockStats>,
    failing: Arc<Mutex<HashSet<Vec<u8>>>>,
    response_delay: Duration,
    pending: Option<Vec<u8>>,
}

#[async_trait]
impl RemoteAudioConnection for MockConnection {
    async fn send(&mut self, audio: &[u8]) -> Result<(), UpstreamError> {
        if !self.is_healthy() {
            return Err(UpstreamError::Unhealthy);
        }
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(audio) {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(UpstreamError::Status(500));
        }
        self.pending = Some(audio.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, UpstreamError> {
        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }
        self.pending.take().ok_or(UpstreamError::NoResponse)
    }

    async fn close(&mut self) -> Result<(), UpstreamError> {
        self.healthy.store(false, Ordering::SeqCst);
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Hands out `MockConnection`s and keeps a handle on each one's health flag.
#[derive(Default)]
pub struct MockFactory {
    pub stats: Arc<MockStats>,
    failing: Arc<Mutex<HashSet<Vec<u8>>>>,
    health: Mutex<Vec<Arc<AtomicBool>>>,
    refuse: AtomicBool,
    response_delay: Mutex<Duration>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Any connection asked to send exactly `payload` fails with a 500 and turns unhealthy.
    pub fn fail_on(&self, payload: &[u8]) {
        self.failing.lock().unwrap().insert(payload.to_vec());
    }

    /// Make `create` fail until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delay every `receive` of connections created from now on.
    pub fn set_response_delay(&self, delay: Duration) {
        *self.response_delay.lock().unwrap() = delay;
    }

    /// Flip the `index`-th created connection unhealthy without closing it.
    pub fn break_connection(&self, index: usize) {
        self.health.lock().unwrap()[index].store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self) -> Result<Box<dyn RemoteAudioConnection>, UpstreamError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("connection refused".to_string()));
        }

        let healthy = Arc::new(AtomicBool::new(true));
        self.health.lock().unwrap().push(healthy.clone());
        self.stats.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConnection {
            healthy,
            stats: self.stats.clone(),
            failing: self.failing.clone(),
            response_delay: *self.response_delay.lock().unwrap(),
            pending: None,
        }))
    }
}
