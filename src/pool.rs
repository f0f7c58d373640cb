//! # Upstream Connection Pool
//!
//! Multiplexes many client sessions onto a small, bounded set of upstream connections.
//! Upstream connections are expensive (rate limited, possibly billed), so their number
//! must not grow with client fan-in.
//!
//! ## How it works:
//! - A semaphore with `max_size` permits bounds the number of leases
//! - Idle connections sit in a FIFO under a mutex; only a permit holder may take one
//!   out or create a new one, so `idle + leased <= max_size` always holds
//! - Every checkout health-checks the idle connection it picked; a dead one is closed
//!   and replaced through the factory
//! - Waiting for a permit is bounded by a timeout and raced against cancellation
//!
//! ## Key Rust Concepts:
//! - **OwnedSemaphorePermit**: The lease owns its permit, so the slot is freed exactly
//!   once, whichever way the lease ends
//! - **Consuming `release`**: Taking the lease by value makes a double release a
//!   compile error instead of corrupted accounting
//! - **Drop fallback**: A lease dropped without `release` still returns its connection

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PoolError, UpstreamError};
use crate::upstream::{ConnectionFactory, RemoteAudioConnection};

/// Point-in-time pool occupancy. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub leased: usize,
    pub idle: usize,
    pub max_size: usize,
}

/// A pooled connection together with its pool-assigned slot id.
struct Slot {
    id: u64,
    conn: Box<dyn RemoteAudioConnection>,
}

struct IdleSet {
    slots: VecDeque<Slot>,
    closed: bool,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<IdleSet>,
    leased: AtomicUsize,
    next_id: AtomicU64,
    max_size: usize,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, IdleSet> {
        // The guarded data stays consistent even if a holder panicked
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a returned connection back, or hand it back to the caller for closing.
    fn take_back(&self, slot: Slot, discard: bool) -> Option<Slot> {
        self.leased.fetch_sub(1, Ordering::SeqCst);

        let mut idle = self.idle();
        let reusable = !discard && !idle.closed && slot.conn.is_healthy();
        if reusable && idle.slots.len() < self.max_size {
            debug!(connection_id = slot.id, "Connection returned to pool");
            idle.slots.push_back(slot);
            None
        } else {
            debug!(
                connection_id = slot.id,
                discard,
                closed = idle.closed,
                "Evicting returned connection"
            );
            Some(slot)
        }
    }
}

async fn close_slot(mut slot: Slot) {
    if let Err(err) = slot.conn.close().await {
        warn!(connection_id = slot.id, error = %err, "Failed to close upstream connection");
    }
}

/// Bounded, health-aware pool of remote audio connections.
///
/// Cheap to clone; every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        max_size: usize,
        acquire_timeout: Duration,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        info!(max_size, acquire_timeout_ms = acquire_timeout.as_millis() as u64, "Connection pool created");
        Self {
            inner: Arc::new(PoolInner {
                factory,
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(IdleSet {
                    slots: VecDeque::with_capacity(max_size),
                    closed: false,
                }),
                leased: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                max_size,
                acquire_timeout,
            }),
        }
    }

    /// Lease a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledConnection, PoolError> {
        self.acquire_timeout(cancel, self.inner.acquire_timeout).await
    }

    /// Lease a connection, waiting at most `timeout` for a free slot.
    ///
    /// A zero timeout still succeeds when a slot is free right now.
    pub async fn acquire_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        if self.inner.idle().closed {
            return Err(PoolError::PoolClosed);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            waited = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()) => {
                match waited {
                    Ok(Ok(permit)) => permit,
                    // The semaphore is only closed by shutdown
                    Ok(Err(_)) => return Err(PoolError::PoolClosed),
                    Err(_) => {
                        debug!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for a pooled connection");
                        return Err(PoolError::Timeout(timeout));
                    }
                }
            }
        };

        let slot = self.checkout().await?;
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = slot.id, "Connection leased");

        Ok(PooledConnection {
            slot: Some(slot),
            pool: self.inner.clone(),
            _permit: permit,
            discard: false,
        })
    }

    /// Take a healthy idle connection or open a new one. Caller holds a permit.
    async fn checkout(&self) -> Result<Slot, PoolError> {
        let candidate = {
            let mut idle = self.inner.idle();
            if idle.closed {
                return Err(PoolError::PoolClosed);
            }
            idle.slots.pop_front()
        };

        match candidate {
            Some(slot) if slot.conn.is_healthy() => return Ok(slot),
            Some(stale) => {
                info!(connection_id = stale.id, "Replacing unhealthy idle connection");
                close_slot(stale).await;
            }
            None => {}
        }

        let conn = self.inner.factory.create().await.map_err(|err: UpstreamError| {
            warn!(error = %err, "Failed to open upstream connection");
            PoolError::from(err)
        })?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, "Opened upstream connection");
        Ok(Slot { id, conn })
    }

    /// Return a lease. Unhealthy or discarded connections, and anything returned after
    /// shutdown, are closed instead of re-pooled.
    pub async fn release(&self, mut lease: PooledConnection) {
        // A lease always goes back to the pool that issued it
        if let Some(slot) = lease.slot.take() {
            if let Some(evicted) = lease.pool.take_back(slot, lease.discard) {
                close_slot(evicted).await;
            }
        }
        // The permit is freed when `lease` drops, after the connection is back in the idle set
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            leased: self.inner.leased.load(Ordering::SeqCst),
            idle: self.inner.idle().slots.len(),
            max_size: self.inner.max_size,
        }
    }

    /// Refuse further leases and close every idle connection. Idempotent.
    pub async fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut idle = self.inner.idle();
            if idle.closed {
                return;
            }
            idle.closed = true;
            idle.slots.drain(..).collect()
        };
        // Wakes every blocked acquirer with PoolClosed
        self.inner.permits.close();

        info!(
            closing_idle = drained.len(),
            leased = self.inner.leased.load(Ordering::SeqCst),
            "Connection pool shutting down"
        );
        for slot in drained {
            close_slot(slot).await;
        }
    }
}

/// An exclusive lease on one upstream connection.
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    discard: bool,
}

impl PooledConnection {
    /// Pool-assigned id of the leased connection, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map_or(0, |slot| slot.id)
    }

    pub async fn send(&mut self, audio: &[u8]) -> Result<(), UpstreamError> {
        match self.slot.as_mut() {
            Some(slot) => slot.conn.send(audio).await,
            None => Err(UpstreamError::Closed),
        }
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, UpstreamError> {
        match self.slot.as_mut() {
            Some(slot) => slot.conn.receive().await,
            None => Err(UpstreamError::Closed),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.conn.is_healthy())
    }

    /// Close the connection on release instead of re-pooling it.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if let Some(evicted) = self.pool.take_back(slot, self.discard) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(close_slot(evicted));
                }
                Err(_) => warn!(connection_id = evicted.id, "No runtime to close dropped connection"),
            }
        }
    }
}
