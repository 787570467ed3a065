//! The reusable WebSocket session core.
//!
//! [`SessionCore`] owns everything one gateway-flavored connection needs:
//! the socket halves, the inflate context, heartbeat bookkeeping, the send
//! lock, and the reconnect machinery. The main gateway and the voice gateway
//! each embed a core and supply their own handshakes and opcode routing
//! through [`SessionDriver`].
//!
//! Two locks carry the whole concurrency story. The send lock (the mutex
//! around the sink) serializes writers *and* is held for the full duration of
//! a reconnect, so no frame can land on a half-identified socket. The
//! `connected` signal is cleared while a reconnect owns the socket; a
//! non-forced receive races its read against that signal and releases the
//! receive half the moment it clears, so a reconnect never has to wait for a
//! dead peer to produce one more frame before it can swap the socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::compression::StreamInflater;
use crate::error::GatewayError;
use crate::limiter::SendLimiter;
use crate::payload::{Hello, InboundFrame};
use crate::signal::Signal;
use crate::socket::{SocketConnector, SocketMessage, SocketSink, SocketStream};

/// Latency samples retained for averaging; the oldest is evicted.
const LATENCY_SAMPLES: usize = 10;

/// Round trips at or above this are logged as high latency.
const HIGH_LATENCY: Duration = Duration::from_secs(15);

/// Close code used when this side tears a connection down to reconnect.
pub const RECONNECT_CLOSE_CODE: u16 = 1012;

/// What to do about a peer close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Surface a fatal error and let the supervisor decide.
    Fatal,
    Reconnect { resume: bool },
}

/// Connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Running,
    Reconnecting,
    Closing,
}

struct RecvHalf {
    stream: Option<Box<dyn SocketStream>>,
    inflater: StreamInflater,
}

/// Result of one guarded read off the socket.
enum ReadOutcome {
    Frame(Option<Result<SocketMessage, GatewayError>>),
    /// The `connected` signal cleared mid-read: a reconnect wants the
    /// receive half.
    ReconnectPending,
}

/// Per-session operations the core calls back into.
#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    fn core(&self) -> &SessionCore;

    /// Write the session's IDENTIFY directly on a freshly opened socket.
    async fn identify(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError>;

    /// Write the session's RESUME directly on a freshly opened socket.
    async fn resume(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError>;

    /// Send one heartbeat through the normal send path, bypassing the rate
    /// limiter.
    async fn send_heartbeat(&self) -> Result<(), GatewayError>;

    /// Route one decoded frame.
    async fn handle_frame(self: Arc<Self>, frame: InboundFrame) -> Result<(), GatewayError>;

    /// Policy for peer close frames. Codes at or above 4000 are fatal by
    /// default; 1000 reconnects without resuming; anything else resumes.
    fn close_action(&self, code: u16) -> CloseAction {
        if code >= 4000 {
            CloseAction::Fatal
        } else {
            CloseAction::Reconnect { resume: code != 1000 }
        }
    }

    /// Error surfaced for a fatal close.
    fn closed_error(&self, code: u16) -> GatewayError {
        GatewayError::SocketClosed { code }
    }

    /// Hook run between tearing down the old socket and dialing the new one.
    /// Returning `false` abandons the reconnect and leaves the session
    /// closing.
    async fn prepare_reconnect(&self, resume: bool) -> Result<bool, GatewayError> {
        let _ = resume;
        Ok(true)
    }
}

/// Shared state machine behind every gateway-flavored WebSocket session.
///
/// A core is single-use: once opened and torn down it cannot be reopened.
pub struct SessionCore {
    connector: Arc<dyn SocketConnector>,
    ws_url: RwLock<String>,
    phase: RwLock<SessionPhase>,

    heartbeat_interval: RwLock<Option<Duration>>,
    sequence: RwLock<Option<u64>>,
    latency: RwLock<VecDeque<Duration>>,
    last_heartbeat: RwLock<Option<Instant>>,
    ack_pending: AtomicBool,

    limiter: SendLimiter,

    /// The write half. Holding this mutex *is* the send lock.
    sink: Mutex<Option<Box<dyn SocketSink>>>,
    /// The read half plus the inflate context, owned by the receive loop.
    recv: Mutex<RecvHalf>,

    /// Set while a usable connection exists; cleared for the duration of a
    /// reconnect.
    connected: Signal,
    close_requested: Signal,
    kill_heartbeat: Signal,
    keep_alive: SyncMutex<Option<JoinHandle<()>>>,
    entered: AtomicBool,
}

impl SessionCore {
    pub fn new(connector: Arc<dyn SocketConnector>, ws_url: String) -> Self {
        Self {
            connector,
            ws_url: RwLock::new(ws_url),
            phase: RwLock::new(SessionPhase::Disconnected),
            heartbeat_interval: RwLock::new(None),
            sequence: RwLock::new(None),
            latency: RwLock::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
            last_heartbeat: RwLock::new(None),
            ack_pending: AtomicBool::new(false),
            limiter: SendLimiter::default(),
            sink: Mutex::new(None),
            recv: Mutex::new(RecvHalf {
                stream: None,
                inflater: StreamInflater::new(),
            }),
            connected: Signal::new(false),
            close_requested: Signal::new(false),
            kill_heartbeat: Signal::new(false),
            keep_alive: SyncMutex::new(None),
            entered: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn sequence(&self) -> Option<u64> {
        *self.sequence.read()
    }

    pub fn set_sequence(&self, sequence: u64) {
        *self.sequence.write() = Some(sequence);
    }

    pub fn clear_sequence(&self) {
        *self.sequence.write() = None;
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        *self.heartbeat_interval.read()
    }

    pub fn ws_url(&self) -> String {
        self.ws_url.read().clone()
    }

    /// Point the session at a new endpoint; takes effect on the next
    /// (re)connect.
    pub fn set_ws_url(&self, url: String) {
        *self.ws_url.write() = url;
    }

    /// Most recent heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.latency.read().back().copied()
    }

    /// Mean of the retained round trips.
    pub fn average_latency(&self) -> Option<Duration> {
        let samples = self.latency.read();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<Duration>() / samples.len() as u32)
    }

    /// Idempotently ask the run loop to stop.
    pub fn close(&self) {
        self.close_requested.set();
    }

    /// Stop the heartbeater at its next check.
    pub fn stop_heartbeater(&self) {
        self.kill_heartbeat.set();
    }

    /// Connect, receive HELLO, start the heartbeater, and identify (or
    /// resume, when the session was built from saved resume state).
    ///
    /// A session object is single-use; a second `open` fails with
    /// [`GatewayError::InvalidState`].
    pub async fn open<S: SessionDriver>(
        &self,
        driver: &Arc<S>,
        resume: bool,
    ) -> Result<(), GatewayError> {
        if self.entered.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::InvalidState(
                "a session instance cannot be re-used",
            ));
        }

        let mut sink = self.sink.lock().await;
        *self.phase.write() = SessionPhase::Connecting;

        let url = self.ws_url();
        let (new_sink, new_stream) = self.connector.connect(&url).await?;
        {
            let mut recv = self.recv.lock().await;
            recv.stream = Some(new_stream);
            recv.inflater.reset();
        }
        *sink = Some(new_sink);

        *self.phase.write() = SessionPhase::AwaitingHello;
        let hello = self.receive(driver.as_ref(), true).await?;
        self.apply_hello(&hello)?;
        self.connected.set();

        let heartbeater = tokio::spawn(run_heartbeater(Arc::clone(driver)));
        *self.keep_alive.lock() = Some(heartbeater);

        let active = sink
            .as_mut()
            .ok_or(GatewayError::InvalidState("socket vanished during open"))?;
        if resume {
            *self.phase.write() = SessionPhase::Resuming;
            driver.resume(active).await?;
        } else {
            *self.phase.write() = SessionPhase::Identifying;
            driver.identify(active).await?;
        }

        *self.phase.write() = SessionPhase::Running;
        Ok(())
    }

    /// Receive and route frames until the close signal fires.
    ///
    /// A receive that completes in the same tick as the close signal is
    /// drained before the loop exits.
    pub async fn run<S: SessionDriver>(&self, driver: &Arc<S>) -> Result<(), GatewayError> {
        loop {
            let frame = tokio::select! {
                biased;
                frame = self.receive(driver.as_ref(), false) => frame?,
                _ = self.close_requested.wait() => {
                    *self.phase.write() = SessionPhase::Closing;
                    return Ok(());
                }
            };

            // The sequence advances on the receive task, before any handler
            // task is spawned.
            if let Some(seq) = frame.s {
                self.set_sequence(seq);
            }

            Arc::clone(driver).handle_frame(frame).await?;
        }
    }

    /// Receive one decoded frame.
    ///
    /// With `force` the safety interlocks are skipped: the caller owns the
    /// socket (handshakes inside `open`/`reconnect`) and close conditions
    /// become hard errors instead of triggering a nested reconnect.
    pub async fn receive<S: SessionDriver>(
        &self,
        driver: &S,
        force: bool,
    ) -> Result<InboundFrame, GatewayError> {
        loop {
            if !force {
                // If another task is reconnecting, wait for it to finish
                // instead of reading the stale socket.
                self.connected.wait().await;
            }

            let mut recv = self.recv.lock().await;
            if !force && !self.connected.is_set() {
                // A reconnect claimed the connection between our wait and
                // the lock; let it have the receive half.
                drop(recv);
                continue;
            }
            let stream = recv
                .stream
                .as_mut()
                .ok_or(GatewayError::InvalidState("receive before connect"))?;

            // The read itself is raced against the connected signal: a
            // zombied peer never produces another frame, so a reconnect
            // clearing the signal must be enough to take the socket back.
            let outcome = if force {
                ReadOutcome::Frame(stream.next_message().await)
            } else {
                tokio::select! {
                    biased;
                    message = stream.next_message() => ReadOutcome::Frame(message),
                    _ = self.connected.wait_cleared() => ReadOutcome::ReconnectPending,
                }
            };
            let message = match outcome {
                ReadOutcome::Frame(message) => message,
                ReadOutcome::ReconnectPending => {
                    drop(recv);
                    continue;
                }
            };

            let text = match message {
                Some(Ok(SocketMessage::Binary(data))) => match recv.inflater.extend(&data)? {
                    Some(text) => text,
                    // Payload still fragmented across frames.
                    None => continue,
                },
                Some(Ok(SocketMessage::Text(text))) => text,
                Some(Ok(SocketMessage::Close(code))) => {
                    drop(recv);
                    let code = code.unwrap_or(0);
                    debug!(code, "peer closed the websocket");

                    match driver.close_action(code) {
                        CloseAction::Fatal => return Err(driver.closed_error(code)),
                        CloseAction::Reconnect { resume } => {
                            if force {
                                return Err(GatewayError::InvalidState(
                                    "peer closed the socket during the handshake",
                                ));
                            }
                            if !self.connected.is_set() {
                                // Echo of our own reconnect close; the swap
                                // is already in progress elsewhere.
                                continue;
                            }
                            self.reconnect(driver, resume, RECONNECT_CLOSE_CODE).await?;
                            continue;
                        }
                    }
                }
                Some(Err(e)) => {
                    drop(recv);
                    if force {
                        return Err(e);
                    }
                    warn!(error = %e, "transport error while receiving");
                    if !self.connected.is_set() {
                        continue;
                    }
                    self.reconnect(driver, true, RECONNECT_CLOSE_CODE).await?;
                    continue;
                }
                None => {
                    drop(recv);
                    if force {
                        return Err(GatewayError::InvalidState(
                            "the socket ended during the handshake",
                        ));
                    }
                    if !self.connected.is_set() {
                        continue;
                    }
                    // The connection died without a closing handshake.
                    self.reconnect(driver, true, RECONNECT_CLOSE_CODE).await?;
                    continue;
                }
            };

            drop(recv);

            match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    // Locally undecodable frames are dropped, not fatal.
                    error!(error = %e, "discarding frame with invalid JSON");
                    continue;
                }
            }
        }
    }

    /// Serialize and write one frame under the send lock.
    pub async fn send_json<T: Serialize>(
        &self,
        payload: &T,
        bypass_limit: bool,
    ) -> Result<(), GatewayError> {
        let text = serde_json::to_string(payload)?;
        self.send_text(&text, bypass_limit).await
    }

    /// Write one text frame under the send lock.
    ///
    /// A reconnect in progress holds the lock, so senders park here until a
    /// clean, identified connection exists.
    pub async fn send_text(&self, text: &str, bypass_limit: bool) -> Result<(), GatewayError> {
        trace!(len = text.len(), "sending frame");
        let mut sink = self.sink.lock().await;
        let active = sink
            .as_mut()
            .ok_or(GatewayError::InvalidState("send before connect"))?;
        if !bypass_limit {
            self.limiter.acquire().await;
        }
        active.send_text(text).await
    }

    /// Tear down the current socket and bring up a fresh, identified (or
    /// resumed) one.
    ///
    /// The send lock is held for the entire duration and the `connected`
    /// signal stays cleared until the new handshake completes.
    pub async fn reconnect<S: SessionDriver>(
        &self,
        driver: &S,
        resume: bool,
        code: u16,
    ) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;
        *self.phase.write() = SessionPhase::Reconnecting;
        self.connected.clear();

        if let Some(mut old) = sink.take() {
            let _ = old.close(code).await;
        }

        // Closing the write half does not wake a reader parked on a silent
        // peer; clearing `connected` above does. Once the reader lets go,
        // drop the stale receive half so the old transport is fully torn
        // down.
        {
            let mut recv = self.recv.lock().await;
            recv.stream = None;
        }

        if !driver.prepare_reconnect(resume).await? {
            return Ok(());
        }

        let url = self.ws_url();
        let (new_sink, new_stream) = self.connector.connect(&url).await?;
        {
            let mut recv = self.recv.lock().await;
            recv.stream = Some(new_stream);
            recv.inflater.reset();
        }
        *sink = Some(new_sink);

        *self.phase.write() = SessionPhase::AwaitingHello;
        let hello = Box::pin(self.receive(driver, true)).await?;
        self.apply_hello(&hello)?;

        let active = sink.as_mut().ok_or(GatewayError::InvalidState(
            "socket vanished during reconnect",
        ))?;
        if resume {
            *self.phase.write() = SessionPhase::Resuming;
            driver.resume(active).await?;
        } else {
            *self.phase.write() = SessionPhase::Identifying;
            driver.identify(active).await?;
        }

        self.connected.set();
        self.ack_pending.store(false, Ordering::SeqCst);
        *self.phase.write() = SessionPhase::Running;
        Ok(())
    }

    /// Stop the heartbeater, then close the socket with a normal-closure
    /// code. Runs on every exit path.
    pub async fn teardown(&self) {
        *self.phase.write() = SessionPhase::Closing;
        self.close_requested.set();
        self.kill_heartbeat.set();
        // Any reader still parked on the socket lets go once this clears.
        self.connected.clear();

        let heartbeater = self.keep_alive.lock().take();
        if let Some(handle) = heartbeater {
            let _ = handle.await;
        }

        let mut sink = self.sink.lock().await;
        if let Some(mut active) = sink.take() {
            let _ = active.close(1000).await;
        }
        self.recv.lock().await.stream = None;
        *self.phase.write() = SessionPhase::Disconnected;
    }

    /// Record a heartbeat acknowledgement: update the latency ring and allow
    /// the next heartbeat tick to proceed.
    pub fn note_heartbeat_ack(&self) {
        if let Some(sent_at) = *self.last_heartbeat.read() {
            let rtt = sent_at.elapsed();
            let mut samples = self.latency.write();
            if samples.len() == LATENCY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(rtt);

            if rtt >= HIGH_LATENCY {
                warn!(
                    rtt_secs = rtt.as_secs_f64(),
                    "heartbeat took a long time to be acknowledged"
                );
            } else {
                trace!(rtt_ms = rtt.as_millis() as u64, "heartbeat acknowledged");
            }
        }
        self.ack_pending.store(false, Ordering::SeqCst);
    }

    fn apply_hello(&self, hello: &InboundFrame) -> Result<(), GatewayError> {
        let hello: Hello = serde_json::from_value(hello.d.clone())?;
        let interval = Duration::from_secs_f64(hello.heartbeat_interval / 1000.0);
        *self.heartbeat_interval.write() = Some(interval);
        debug!(interval_ms = hello.heartbeat_interval, "received HELLO");
        Ok(())
    }
}

/// Heartbeater task entry point. A failing heartbeater closes the session so
/// the supervisor can restart it.
async fn run_heartbeater<S: SessionDriver>(driver: Arc<S>) {
    if let Err(e) = heartbeat_loop(&driver).await {
        error!(error = %e, "the heartbeater failed; closing the session");
        driver.core().close();
    }
}

async fn heartbeat_loop<S: SessionDriver>(driver: &Arc<S>) -> Result<(), GatewayError> {
    let core = driver.core();
    let mut interval = core
        .heartbeat_interval()
        .ok_or(GatewayError::InvalidState("heartbeater started before HELLO"))?;
    debug!(interval_secs = interval.as_secs_f64(), "heartbeating");

    while !core.kill_heartbeat.is_set() {
        if core.ack_pending.load(Ordering::SeqCst) {
            warn!(
                interval_secs = interval.as_secs_f64(),
                "heartbeat went unacknowledged for a full interval, likely a zombied connection; reconnecting"
            );
            core.reconnect(driver.as_ref(), true, RECONNECT_CLOSE_CODE).await?;
        }

        core.ack_pending.store(true, Ordering::SeqCst);
        *core.last_heartbeat.write() = Some(Instant::now());
        driver.send_heartbeat().await?;

        // HELLO on a reconnected socket may have changed the interval.
        if let Some(updated) = core.heartbeat_interval() {
            interval = updated;
        }
        if core.kill_heartbeat.wait_timeout(interval).await {
            return Ok(());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnector;

    struct NullDriver {
        core: SessionCore,
    }

    #[async_trait]
    impl SessionDriver for NullDriver {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        async fn identify(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
            sink.send_text(r#"{"op":2,"d":{}}"#).await
        }

        async fn resume(&self, sink: &mut Box<dyn SocketSink>) -> Result<(), GatewayError> {
            sink.send_text(r#"{"op":6,"d":{}}"#).await
        }

        async fn send_heartbeat(&self) -> Result<(), GatewayError> {
            self.core.send_text(r#"{"op":1,"d":null}"#, true).await
        }

        async fn handle_frame(self: Arc<Self>, _frame: InboundFrame) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_before_connect_is_an_invalid_state() {
        let (connector, _peers) = ScriptedConnector::with_connections(0);
        let core = SessionCore::new(connector, "wss://gateway.test".to_string());

        let err = core.send_text("{}", false).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(_)));
    }

    #[tokio::test]
    async fn a_session_cannot_be_reentered() {
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let driver = Arc::new(NullDriver {
            core: SessionCore::new(connector, "wss://gateway.test".to_string()),
        });

        peers[0].feed_text(r#"{"op":10,"d":{"heartbeat_interval":45000}}"#);
        driver.core.open(&driver, false).await.unwrap();

        let err = driver.core.open(&driver, false).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(_)));

        driver.core.teardown().await;
    }

    #[tokio::test]
    async fn open_captures_the_heartbeat_interval() {
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let driver = Arc::new(NullDriver {
            core: SessionCore::new(connector, "wss://gateway.test".to_string()),
        });

        peers[0].feed_text(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        driver.core.open(&driver, false).await.unwrap();

        assert_eq!(
            driver.core.heartbeat_interval(),
            Some(Duration::from_millis(41250))
        );
        assert_eq!(driver.core.phase(), SessionPhase::Running);

        driver.core.teardown().await;
        assert_eq!(driver.core.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn teardown_closes_the_socket_with_a_normal_code() {
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let driver = Arc::new(NullDriver {
            core: SessionCore::new(connector, "wss://gateway.test".to_string()),
        });

        peers[0].feed_text(r#"{"op":10,"d":{"heartbeat_interval":45000}}"#);
        driver.core.open(&driver, false).await.unwrap();
        driver.core.teardown().await;

        // IDENTIFY, maybe a heartbeat, then the close frame.
        let mut saw_close = false;
        while let Ok(frame) = peers[0].outbound.try_recv() {
            if let crate::testing::SentFrame::Close(code) = frame {
                assert_eq!(code, 1000);
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn invalid_json_frames_are_skipped() {
        let (connector, peers) = ScriptedConnector::with_connections(1);
        let driver = Arc::new(NullDriver {
            core: SessionCore::new(connector, "wss://gateway.test".to_string()),
        });

        peers[0].feed_text(r#"{"op":10,"d":{"heartbeat_interval":45000}}"#);
        driver.core.open(&driver, false).await.unwrap();

        peers[0].feed_text("this is not json");
        peers[0].feed_text(r#"{"op":11}"#);

        let frame = driver.core.receive(driver.as_ref(), false).await.unwrap();
        assert_eq!(frame.op, 11);

        driver.core.teardown().await;
    }

    #[tokio::test]
    async fn latency_ring_is_bounded() {
        let (connector, _peers) = ScriptedConnector::with_connections(0);
        let core = SessionCore::new(connector, "wss://gateway.test".to_string());

        for _ in 0..25 {
            *core.last_heartbeat.write() = Some(Instant::now());
            core.note_heartbeat_ack();
        }
        assert_eq!(core.latency.read().len(), LATENCY_SAMPLES);
        assert!(core.average_latency().is_some());
    }
}
