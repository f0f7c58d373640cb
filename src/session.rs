//! # Session Pipeline
//!
//! Drives one client's bidirectional audio stream. A session runs three activities
//! concurrently, all under one cancellation scope:
//!
//! 1. **Read loop**: pulls frames off the client link, validates and decodes binary
//!    audio, and pushes it onto a small bounded queue (backpressure when full)
//! 2. **Dispatch loop**: for each queued frame, leases an upstream connection, sends the
//!    frame, waits for the response, returns the lease, encodes the response and writes it
//!    back to the client
//! 3. **Keepalive**: pings the client on a fixed interval
//!
//! ## State Machine:
//! `Active → Closing → Closed`. Any terminal error, a client close or cancellation moves
//! the session to `Closing`; once all three activities have returned it is `Closed`.
//!
//! ## Failure Isolation:
//! A frame that fails anywhere in dispatch (codec, pool timeout, upstream) is logged and
//! dropped. The client simply gets no response for it; the session keeps running.
//!
//! The pipeline never touches a socket directly. It talks to the client through a
//! [`ClientLink`], a pair of channels the WebSocket actor feeds and drains.

use std::sync::Arc;
use std::time::Duration;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::codec::AudioProcessor;
use crate::error::{CodecError, PoolError, SessionError, TransportError, UpstreamError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::state::GatewayMetrics;

/// Close code for a normal, intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent by a peer that is going away (page unload, server restart).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Reported locally when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Timings and queue size for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }
}

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// A frame the session wants written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// What the socket side hands the session: a frame, or the error that broke the socket.
pub type InboundFrame = Result<ClientFrame, TransportError>;

/// The session's view of its client connection.
///
/// `inbound` ends when the client socket is gone; dropping `outbound` tells the socket
/// side to shut down. `inbound` is bounded: while the read loop is parked on a full
/// dispatch queue, the socket side stops reading from the client.
pub struct ClientLink {
    pub inbound: mpsc::Receiver<InboundFrame>,
    pub outbound: mpsc::Sender<OutboundFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Shared collaborators every session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub pool: ConnectionPool,
    pub processor: Arc<AudioProcessor>,
    pub config: SessionConfig,
    pub metrics: Arc<GatewayMetrics>,
}

/// Why a single frame was dropped. Only some of these end the session.
#[derive(Debug, Error)]
enum FrameError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("upstream call interrupted by cancellation")]
    Interrupted,
}

/// Decide whether a client close ends the session cleanly.
pub fn classify_close(frame: Option<CloseFrame>) -> Result<(), TransportError> {
    match frame {
        None => Ok(()),
        Some(CloseFrame { code, .. })
            if code == CLOSE_NORMAL || code == CLOSE_GOING_AWAY || code == CLOSE_ABNORMAL =>
        {
            Ok(())
        }
        Some(CloseFrame { code, reason }) => Err(TransportError::AbnormalClose { code, reason }),
    }
}

/// Parse an advisory text control message into a JSON object.
pub fn parse_control(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub struct GatewaySession {
    id: Uuid,
    cancel: CancellationToken,
    ctx: SessionContext,
    state: watch::Sender<SessionState>,
}

impl GatewaySession {
    /// Create a session whose cancellation scope is a child of `parent`.
    pub fn new(id: Uuid, parent: &CancellationToken, ctx: SessionContext) -> Self {
        let (state, _) = watch::channel(SessionState::Active);
        Self {
            id,
            cancel: parent.child_token(),
            ctx,
            state,
        }
    }

    /// Follow the session's state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token that ends this session (and only this one) when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session until the client leaves, a terminal error occurs or the scope is
    /// cancelled. Returns the first terminal error, if any.
    pub async fn run(self, link: ClientLink) -> Result<(), SessionError> {
        let ClientLink { inbound, outbound } = link;
        let (queue_tx, queue_rx) = mpsc::channel(self.ctx.config.queue_capacity.max(1));

        self.ctx.metrics.session_opened();
        info!(session_id = %self.id, "Session started");

        let (read, dispatch, keepalive) = tokio::join!(
            self.read_loop(inbound, queue_tx),
            self.dispatch_loop(queue_rx, &outbound),
            self.keepalive_loop(&outbound),
        );

        // All loops are done; nothing else writes to the client from here on
        if outbound
            .try_send(OutboundFrame::Close(Some(CloseFrame::normal())))
            .is_err()
        {
            debug!(session_id = %self.id, "Client already gone, skipping close frame");
        }
        drop(outbound);

        self.state.send_replace(SessionState::Closed);
        let result = read.and(dispatch).and(keepalive);
        self.ctx.metrics.session_closed(result.is_err());

        match &result {
            Ok(()) => info!(session_id = %self.id, "Session closed"),
            Err(err) => error!(session_id = %self.id, error = %err, "Session closed with error"),
        }
        result
    }

    /// Move to `Closing` (once) and stop every activity.
    fn begin_closing(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(session_id = %self.id, "Session closing");
        }
        self.cancel.cancel();
    }

    async fn read_loop(
        &self,
        mut inbound: mpsc::Receiver<InboundFrame>,
        queue: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let read_timeout = self.ctx.config.read_timeout;
        let mut deadline = Instant::now() + read_timeout;

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                next = tokio::time::timeout_at(deadline, inbound.recv()) => next,
            };

            let frame = match next {
                Err(_) => break Err(TransportError::ReadTimeout.into()),
                // Socket side went away without a close frame
                Ok(None) => break Ok(()),
                Ok(Some(Err(err))) => break Err(err.into()),
                Ok(Some(Ok(frame))) => frame,
            };
            // Any frame, pongs included, proves the client is alive
            deadline = Instant::now() + read_timeout;

            match frame {
                ClientFrame::Binary(data) => {
                    self.ctx.metrics.frame_received(data.len());
                    let audio = match self.ctx.processor.ingress(data) {
                        Ok(audio) => audio,
                        Err(err) => {
                            warn!(session_id = %self.id, error = %err, "Dropping invalid client frame");
                            self.ctx.metrics.frame_dropped();
                            continue;
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Ok(()),
                        sent = queue.send(audio) => {
                            if sent.is_err() {
                                // Dispatch has already stopped
                                break Ok(());
                            }
                        }
                    }
                }
                ClientFrame::Text(text) => match parse_control(&text) {
                    Some(control) => {
                        debug!(session_id = %self.id, keys = ?control.keys().collect::<Vec<_>>(), "Control message")
                    }
                    None => debug!(session_id = %self.id, "Ignoring non-JSON text frame"),
                },
                ClientFrame::Ping(_) | ClientFrame::Pong(_) => {
                    trace!(session_id = %self.id, "Control frame from client");
                }
                ClientFrame::Close(frame) => {
                    debug!(session_id = %self.id, ?frame, "Client closed");
                    break classify_close(frame).map_err(SessionError::from);
                }
            }
        };

        self.begin_closing();
        result
    }

    async fn dispatch_loop(
        &self,
        mut queue: mpsc::Receiver<Vec<u8>>,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), SessionError> {
        let result = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                frame = queue.recv() => match frame {
                    Some(frame) => frame,
                    None => break Ok(()),
                },
            };

            match self.dispatch_frame(frame, outbound).await {
                Ok(()) => {}
                Err(FrameError::Pool(PoolError::PoolClosed)) => break Err(SessionError::PoolClosed),
                Err(FrameError::Transport(err)) => break Err(err.into()),
                Err(FrameError::Pool(PoolError::Cancelled)) | Err(FrameError::Interrupted) => {
                    self.ctx.metrics.frame_dropped();
                    break Ok(());
                }
                Err(err) => {
                    match &err {
                        FrameError::Upstream(_) => self.ctx.metrics.upstream_failed(),
                        FrameError::Pool(PoolError::Timeout(_)) => self.ctx.metrics.pool_timed_out(),
                        _ => {}
                    }
                    warn!(session_id = %self.id, error = %err, "Dropping frame");
                    self.ctx.metrics.frame_dropped();
                }
            }
        };

        self.begin_closing();
        result
    }

    /// Carry one frame through the pool, the upstream and back to the client.
    async fn dispatch_frame(
        &self,
        frame: Vec<u8>,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), FrameError> {
        let mut lease = self.ctx.pool.acquire(&self.cancel).await?;

        let exchanged = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = exchange(&mut lease, &frame) => Some(result),
        };

        let response = match exchanged {
            Some(result) => {
                self.ctx.pool.release(lease).await;
                result?
            }
            None => {
                // Protocol state of an interrupted call is unknown
                lease.discard();
                self.ctx.pool.release(lease).await;
                return Err(FrameError::Interrupted);
            }
        };

        let mut written = 0;
        for chunk in self.ctx.processor.egress(response)? {
            written += chunk.len();
            self.write(outbound, OutboundFrame::Binary(chunk)).await?;
        }
        self.ctx.metrics.response_sent(written);
        Ok(())
    }

    async fn keepalive_loop(&self, outbound: &mpsc::Sender<OutboundFrame>) -> Result<(), SessionError> {
        let interval = self.ctx.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(err) = self.write(outbound, OutboundFrame::Ping(Vec::new())).await {
                        debug!(session_id = %self.id, error = %err, "Keepalive ping failed");
                        break Err(TransportError::PingFailed.into());
                    }
                    trace!(session_id = %self.id, "Keepalive ping sent");
                }
            }
        };

        self.begin_closing();
        result
    }

    /// Queue one frame for the client, bounded by the write deadline.
    async fn write(
        &self,
        outbound: &mpsc::Sender<OutboundFrame>,
        frame: OutboundFrame,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(self.ctx.config.write_timeout, outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::WriteFailed),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}

async fn exchange(lease: &mut PooledConnection, frame: &[u8]) -> Result<Vec<u8>, UpstreamError> {
    lease.send(frame).await?;
    lease.receive().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{mulaw_to_pcm, pcm_to_mulaw, AudioEncoding};
    use crate::upstream::mock::MockFactory;
    use tokio::task::JoinHandle;

    struct Harness {
        client: mpsc::Sender<InboundFrame>,
        responses: mpsc::Receiver<OutboundFrame>,
        state: watch::Receiver<SessionState>,
        cancel: CancellationToken,
        task: JoinHandle<Result<(), SessionError>>,
    }

    impl Harness {
        fn push(&self, frame: InboundFrame) {
            self.client.try_send(frame).unwrap();
        }

        fn send_audio(&self, data: &[u8]) {
            self.push(Ok(ClientFrame::Binary(data.to_vec())));
        }

        /// Next binary frame written to the client, skipping pings.
        async fn next_audio(&mut self) -> Vec<u8> {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(2), self.responses.recv())
                    .await
                    .expect("timed out waiting for a response")
                    .expect("outbound channel closed");
                match frame {
                    OutboundFrame::Binary(data) => return data,
                    OutboundFrame::Ping(_) => continue,
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        }

        async fn finish(&mut self) -> Result<(), SessionError> {
            tokio::time::timeout(Duration::from_secs(2), &mut self.task)
                .await
                .expect("session did not stop")
                .unwrap()
        }
    }

    fn context(pool: ConnectionPool, encoding: AudioEncoding, chunk_size: usize, config: SessionConfig) -> SessionContext {
        SessionContext {
            pool,
            processor: Arc::new(AudioProcessor::new(encoding, chunk_size)),
            config,
            metrics: Arc::new(GatewayMetrics::default()),
        }
    }

    fn start(ctx: SessionContext) -> Harness {
        let (client, inbound) = mpsc::channel(16);
        let (outbound, responses) = mpsc::channel(16);
        let parent = CancellationToken::new();
        let session = GatewaySession::new(Uuid::new_v4(), &parent, ctx);
        let state = session.subscribe();
        let cancel = session.cancel_token();
        let task = tokio::spawn(session.run(ClientLink { inbound, outbound }));
        Harness {
            client,
            responses,
            state,
            cancel,
            task,
        }
    }

    fn mock_pool(max_size: usize) -> (ConnectionPool, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(max_size, Duration::from_secs(1), factory.clone());
        (pool, factory)
    }

    fn pcm_context(pool: ConnectionPool) -> SessionContext {
        context(pool, AudioEncoding::Pcm16, 8192, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_responses_follow_request_order() {
        let (pool, _factory) = mock_pool(2);
        let mut harness = start(pcm_context(pool.clone()));

        harness.send_audio(&[1, 2]);
        harness.send_audio(&[3, 4]);
        harness.send_audio(&[5, 6]);

        assert_eq!(harness.next_audio().await, vec![1, 2]);
        assert_eq!(harness.next_audio().await, vec![3, 4]);
        assert_eq!(harness.next_audio().await, vec![5, 6]);

        harness.push(Ok(ClientFrame::Close(Some(CloseFrame::normal()))));
        harness.finish().await.unwrap();

        assert_eq!(*harness.state.borrow(), SessionState::Closed);
        assert_eq!(
            harness.responses.recv().await,
            Some(OutboundFrame::Close(Some(CloseFrame::normal())))
        );
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_failed_frame_is_dropped_and_session_stays_active() {
        let (pool, factory) = mock_pool(1);
        factory.fail_on(&[3, 4]);
        let ctx = pcm_context(pool);
        let metrics = ctx.metrics.clone();
        let mut harness = start(ctx);

        harness.send_audio(&[1, 2]);
        harness.send_audio(&[3, 4]);
        harness.send_audio(&[5, 6]);

        assert_eq!(harness.next_audio().await, vec![1, 2]);
        assert_eq!(harness.next_audio().await, vec![5, 6]);
        assert_eq!(*harness.state.borrow(), SessionState::Active);
        assert_eq!(metrics.snapshot().frames_dropped, 1);
        assert_eq!(metrics.snapshot().upstream_failures, 1);
        assert_eq!(metrics.snapshot().responses_sent, 2);
        assert_eq!(factory.stats.sends(), 3);
        // The connection that failed frame 2 was closed and replaced
        assert_eq!(factory.stats.created(), 2);
        assert_eq!(factory.stats.closed(), 1);

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_client_frame_is_dropped() {
        let (pool, _factory) = mock_pool(1);
        let mut harness = start(pcm_context(pool));

        harness.send_audio(&[]);
        harness.send_audio(&[7, 8]);
        assert_eq!(harness.next_audio().await, vec![7, 8]);

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_response_is_chunked_in_order() {
        let (pool, _factory) = mock_pool(1);
        let mut harness = start(context(pool, AudioEncoding::Pcm16, 4, SessionConfig::default()));

        harness.send_audio(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(harness.next_audio().await, vec![0, 1, 2, 3]);
        assert_eq!(harness.next_audio().await, vec![4, 5, 6, 7]);
        assert_eq!(harness.next_audio().await, vec![8, 9]);

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_mulaw_client_is_transcoded_both_ways() {
        let (pool, factory) = mock_pool(1);
        let mut harness = start(context(pool, AudioEncoding::Mulaw, 8192, SessionConfig::default()));

        let input = vec![0xFF, 0x7F, 0x2C, 0xAC];
        harness.send_audio(&input);

        let expected = pcm_to_mulaw(&mulaw_to_pcm(&input)).unwrap();
        assert_eq!(harness.next_audio().await, expected);
        assert_eq!(factory.stats.sends(), 1);

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_ends_session() {
        let (pool, _factory) = mock_pool(1);
        let config = SessionConfig {
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut harness = start(context(pool, AudioEncoding::Pcm16, 8192, config));

        let result = harness.finish().await;
        assert!(matches!(result, Err(SessionError::Transport(TransportError::ReadTimeout))));
    }

    #[tokio::test]
    async fn test_pongs_refresh_read_deadline() {
        let (pool, _factory) = mock_pool(1);
        let config = SessionConfig {
            read_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let mut harness = start(context(pool, AudioEncoding::Pcm16, 8192, config));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            harness.push(Ok(ClientFrame::Pong(Vec::new())));
        }
        assert_eq!(*harness.state.borrow(), SessionState::Active);

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_pings_client() {
        let (pool, _factory) = mock_pool(1);
        let config = SessionConfig {
            ping_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let mut harness = start(context(pool, AudioEncoding::Pcm16, 8192, config));

        let frame = tokio::time::timeout(Duration::from_secs(1), harness.responses.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(OutboundFrame::Ping(Vec::new())));

        harness.cancel.cancel();
        harness.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_ping_is_terminal() {
        let (pool, _factory) = mock_pool(1);
        let config = SessionConfig {
            ping_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let mut harness = start(context(pool, AudioEncoding::Pcm16, 8192, config));
        harness.responses.close();

        let result = harness.finish().await;
        assert!(matches!(result, Err(SessionError::Transport(TransportError::PingFailed))));
    }

    #[tokio::test]
    async fn test_abnormal_close_code_is_an_error() {
        let (pool, _factory) = mock_pool(1);
        let mut harness = start(pcm_context(pool));

        harness.push(Ok(ClientFrame::Close(Some(CloseFrame {
            code: 4000,
            reason: "bad client".to_string(),
        }))));

        let result = harness.finish().await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::AbnormalClose { code: 4000, .. }))
        ));
    }

    #[tokio::test]
    async fn test_transport_error_from_client_is_terminal() {
        let (pool, _factory) = mock_pool(1);
        let mut harness = start(pcm_context(pool));

        harness.push(Err(TransportError::Protocol("overflow".to_string())));
        let result = harness.finish().await;
        assert!(matches!(result, Err(SessionError::Transport(TransportError::Protocol(_)))));
    }

    #[tokio::test]
    async fn test_parent_cancellation_closes_session() {
        let (pool, _factory) = mock_pool(1);
        let (client, inbound) = mpsc::channel::<InboundFrame>(16);
        let (outbound, _responses) = mpsc::channel(16);
        let parent = CancellationToken::new();
        let session = GatewaySession::new(Uuid::new_v4(), &parent, pcm_context(pool));
        let mut state = session.subscribe();
        let task = tokio::spawn(session.run(ClientLink { inbound, outbound }));

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow_and_update(), SessionState::Closed);
        drop(client);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_upstream_call_and_discards_connection() {
        let (pool, factory) = mock_pool(1);
        factory.set_response_delay(Duration::from_secs(30));
        let mut harness = start(pcm_context(pool.clone()));

        harness.send_audio(&[1, 2]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().leased, 1);

        harness.cancel.cancel();
        harness.finish().await.unwrap();

        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(factory.stats.closed(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_the_client_side() {
        let (pool, factory) = mock_pool(1);
        factory.set_response_delay(Duration::from_secs(30));
        let config = SessionConfig {
            queue_capacity: 1,
            ..SessionConfig::default()
        };
        let ctx = context(pool, AudioEncoding::Pcm16, 8192, config);
        let metrics = ctx.metrics.clone();

        let (client, inbound) = mpsc::channel::<InboundFrame>(2);
        let (outbound, _responses) = mpsc::channel(16);
        let parent = CancellationToken::new();
        let session = GatewaySession::new(Uuid::new_v4(), &parent, ctx);
        let task = tokio::spawn(session.run(ClientLink { inbound, outbound }));

        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let producer = {
            let accepted = accepted.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    if client.send(Ok(ClientFrame::Binary(vec![0; 4096]))).await.is_err() {
                        break;
                    }
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        let accepted_now = accepted.load(std::sync::atomic::Ordering::SeqCst);
        let read = metrics.snapshot().frames_received as usize;
        // One frame upstream, one in the queue, one held by the read loop, two in the link
        assert!(accepted_now <= read + 2, "accepted {} frames, read {}", accepted_now, read);
        assert!(accepted_now <= 5, "accepted {} frames", accepted_now);
        assert!(!producer.is_finished());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_closed_is_terminal() {
        let (pool, _factory) = mock_pool(1);
        pool.shutdown().await;
        let mut harness = start(pcm_context(pool));

        harness.send_audio(&[1, 2]);
        let result = harness.finish().await;
        assert!(matches!(result, Err(SessionError::PoolClosed)));
    }

    #[test]
    fn test_close_classification() {
        assert!(classify_close(None).is_ok());
        assert!(classify_close(Some(CloseFrame::normal())).is_ok());
        for code in [CLOSE_GOING_AWAY, CLOSE_ABNORMAL] {
            let frame = CloseFrame { code, reason: String::new() };
            assert!(classify_close(Some(frame)).is_ok());
        }
        let err = classify_close(Some(CloseFrame {
            code: 1008,
            reason: "policy".to_string(),
        }))
        .unwrap_err();
        assert_eq!(
            err,
            TransportError::AbnormalClose {
                code: 1008,
                reason: "policy".to_string()
            }
        );
    }

    #[test]
    fn test_control_messages_parse_as_objects() {
        let control = parse_control(r#"{"type":"config","sampleRate":16000}"#).unwrap();
        assert_eq!(control.get("sampleRate"), Some(&Value::from(16000)));
        assert!(parse_control("[1,2,3]").is_none());
        assert!(parse_control("not json").is_none());
    }
}
