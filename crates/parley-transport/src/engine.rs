//! The session engine.
//!
//! The engine owns every live session regardless of which byte-transport
//! carries it. Each session has a bounded outbound queue that is drained
//! either by HTTP long-poll requests or by a WebSocket writer task, a
//! heartbeat task, and a cancellation token that ends all of it at once.

use dashmap::DashMap;
use parley_protocol::{codec, Frame, Handshake, Packet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::traits::{
    CloseReason, Connection, EngineHandler, FrameSink, FrameStream, SessionId, TransportError,
};
use crate::upgrade::{upgrades_for, TransportKind};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// How long to wait for a pong before closing the session.
    pub ping_timeout: Duration,
    /// Largest inbound payload accepted, in bytes.
    pub max_payload: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_buffer: usize,
    /// Transports clients may use.
    pub transports: Vec<TransportKind>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(20_000),
            max_payload: 1_000_000,
            outbound_buffer: 256,
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
        }
    }
}

struct Session {
    id: SessionId,
    transport: StdMutex<TransportKind>,
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    pong: Notify,
    upgraded: Notify,
    cancel: CancellationToken,
}

impl Session {
    fn transport(&self) -> TransportKind {
        *self
            .transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_transport(&self, kind: TransportKind) {
        *self
            .transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = kind;
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Cloneable handle for queueing frames on one session.
///
/// Handles stay valid after the session closes; sends then fail with
/// `ConnectionClosed`.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// The session this handle writes to.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` once the session has ended, `SendFailed` if the
    /// outbound queue is full.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::SendFailed("outbound queue full".into()),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

struct EngineInner {
    config: EngineConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    handler: Arc<dyn EngineHandler>,
}

/// The transport engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine that reports session events to `handler`.
    #[must_use]
    pub fn new(config: EngineConfig, handler: Arc<dyn EngineHandler>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                sessions: DashMap::new(),
                handler,
            }),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of live sessions on each transport.
    #[must_use]
    pub fn sessions_by_transport(&self) -> (usize, usize) {
        self.inner
            .sessions
            .iter()
            .fold((0, 0), |(polling, ws), entry| match entry.transport() {
                TransportKind::Polling => (polling + 1, ws),
                TransportKind::WebSocket => (polling, ws + 1),
            })
    }

    /// Current transport of a session.
    #[must_use]
    pub fn transport_of(&self, sid: &SessionId) -> Option<TransportKind> {
        self.inner.sessions.get(sid).map(|s| s.transport())
    }

    fn session(&self, sid: &SessionId) -> Result<Arc<Session>, TransportError> {
        self.inner
            .sessions
            .get(sid)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| TransportError::UnknownSession(sid.to_string()))
    }

    /// Open a new session and return the handshake to send the client.
    pub async fn open(&self, kind: TransportKind) -> Handshake {
        let (_, handshake) = self.open_session(kind).await;
        handshake
    }

    async fn open_session(&self, kind: TransportKind) -> (Arc<Session>, Handshake) {
        let config = &self.inner.config;
        let (tx, rx) = mpsc::channel(config.outbound_buffer.max(1));
        let session = Arc::new(Session {
            id: SessionId::generate(),
            transport: StdMutex::new(kind),
            tx,
            rx: Mutex::new(rx),
            pong: Notify::new(),
            upgraded: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let handshake = Handshake {
            sid: session.id.to_string(),
            upgrades: upgrades_for(kind, &config.transports),
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: config.max_payload as u64,
        };

        // A WebSocket client reads the open frame off the socket itself.
        if kind == TransportKind::WebSocket {
            let _ = session.tx.try_send(Frame::open(handshake.clone()));
        }

        self.inner
            .sessions
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session = %session.id, transport = %kind, "Session opened");

        self.spawn_heartbeat(Arc::clone(&session));
        self.inner.handler.on_open(session.handle()).await;

        (session, handshake)
    }

    fn spawn_heartbeat(&self, session: Arc<Session>) {
        let engine = self.clone();
        let interval = self.inner.config.ping_interval;
        let timeout = self.inner.config.ping_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let pong = session.pong.notified();
                tokio::pin!(pong);
                pong.as_mut().enable();

                if let Err(TrySendError::Closed(_)) = session.tx.try_send(Frame::ping()) {
                    return;
                }

                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = &mut pong => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!(session = %session.id, "Heartbeat deadline missed");
                        engine.close(&session.id, CloseReason::PingTimeout).await;
                        return;
                    }
                }
            }
        });
    }

    /// Queue an outbound frame on a session.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the session no longer exists.
    pub fn send(&self, sid: &SessionId, frame: Frame) -> Result<(), TransportError> {
        let session = self
            .session(sid)
            .map_err(|_| TransportError::ConnectionClosed)?;
        session.handle().send(frame)
    }

    /// Serve one long-poll request.
    ///
    /// Waits for at least one queued frame, then drains whatever else is
    /// queued. A poll pending when the session upgrades returns a single
    /// noop; one pending when the session closes returns a close frame.
    ///
    /// # Errors
    ///
    /// Fails for unknown or upgraded sessions, and when another poll for the
    /// same session is already pending.
    pub async fn poll(&self, sid: &SessionId) -> Result<Vec<Frame>, TransportError> {
        let session = self.session(sid)?;

        let upgraded = session.upgraded.notified();
        tokio::pin!(upgraded);
        upgraded.as_mut().enable();

        if session.transport() != TransportKind::Polling {
            return Err(TransportError::InvalidTransport("session upgraded"));
        }

        let mut rx = session
            .rx
            .try_lock()
            .map_err(|_| TransportError::DuplicatePoll)?;

        let first = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return Ok(vec![Frame::Close]),
            _ = &mut upgraded => return Ok(vec![Frame::Noop]),
            frame = rx.recv() => frame.unwrap_or(Frame::Close),
        };

        let mut frames = vec![first];
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Deliver a posted polling payload.
    ///
    /// # Errors
    ///
    /// Fails for oversized or undecodable payloads, unknown sessions, and
    /// sessions that already moved to a WebSocket.
    pub async fn ingest_payload(&self, sid: &SessionId, body: &str) -> Result<(), TransportError> {
        if body.len() > self.inner.config.max_payload {
            return Err(TransportError::PayloadTooLarge(body.len()));
        }
        let frames = codec::decode_payload(body)?;
        self.ingest(sid, frames).await
    }

    /// Deliver inbound frames received over polling.
    ///
    /// # Errors
    ///
    /// Fails for unknown sessions and sessions no longer on polling.
    pub async fn ingest(&self, sid: &SessionId, frames: Vec<Frame>) -> Result<(), TransportError> {
        let session = self.session(sid)?;
        if session.transport() != TransportKind::Polling {
            return Err(TransportError::InvalidTransport("session upgraded"));
        }
        for frame in frames {
            self.handle_frame(&session, frame).await;
        }
        Ok(())
    }

    async fn handle_frame(&self, session: &Arc<Session>, frame: Frame) {
        match frame {
            frame if frame.is_pong() => session.pong.notify_waiters(),
            Frame::Message { packet } => {
                self.inner.handler.on_message(&session.id, packet).await;
            }
            Frame::Close => {
                self.close(&session.id, CloseReason::ClientClose).await;
            }
            other => {
                debug!(session = %session.id, frame = ?other.frame_type(), "Ignoring frame");
            }
        }
    }

    /// Drive a WebSocket connection.
    ///
    /// Without `sid` the connection opens a fresh session. With `sid` it is
    /// an upgrade of an existing polling session: the client must finish the
    /// probe exchange and send an upgrade frame within the ping timeout.
    /// Returns once the connection or the session ends.
    ///
    /// # Errors
    ///
    /// Fails if the upgrade target is unknown or the probe exchange fails;
    /// the polling session is left intact in that case.
    pub async fn serve(
        &self,
        sid: Option<SessionId>,
        conn: Box<dyn Connection>,
    ) -> Result<(), TransportError> {
        let remote = conn.remote_addr();
        let (mut sink, mut stream) = conn.split();

        let session = match sid {
            Some(sid) => {
                let session = self.session(&sid)?;
                if session.transport() != TransportKind::Polling {
                    return Err(TransportError::InvalidTransport("session already upgraded"));
                }
                self.probe(sink.as_mut(), stream.as_mut()).await?;
                session.set_transport(TransportKind::WebSocket);
                session.upgraded.notify_waiters();
                info!(session = %session.id, "Session upgraded to websocket");
                session
            }
            None => self.open_session(TransportKind::WebSocket).await.0,
        };

        debug!(session = %session.id, remote = ?remote, "WebSocket attached");
        let writer = tokio::spawn(write_loop(Arc::clone(&session), sink));

        // Event packets run on their own task, in arrival order, so a slow
        // handler never holds up pongs or close frames.
        let (inbound, queued) = mpsc::channel(self.inner.config.outbound_buffer.max(1));
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner.handler),
            session.id.clone(),
            queued,
        ));

        let reason = loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break None,
                frame = stream.recv() => match frame {
                    Ok(Some(Frame::Message { packet })) => {
                        if inbound.send(packet).await.is_err() {
                            break Some(CloseReason::TransportError);
                        }
                    }
                    Ok(Some(frame)) => self.handle_frame(&session, frame).await,
                    Ok(None) => break Some(CloseReason::TransportClose),
                    Err(TransportError::Protocol(e)) => {
                        warn!(session = %session.id, error = %e, "Dropping undecodable frame");
                    }
                    Err(e) => {
                        warn!(session = %session.id, error = %e, "WebSocket read failed");
                        break Some(CloseReason::TransportError);
                    }
                }
            }
        };

        drop(inbound);
        match reason {
            Some(reason) => {
                // Queued events land before the handler hears about the close.
                let _ = dispatcher.await;
                self.close(&session.id, reason).await;
            }
            None => dispatcher.abort(),
        }
        let _ = writer.await;
        Ok(())
    }

    async fn probe(
        &self,
        sink: &mut dyn FrameSink,
        stream: &mut dyn FrameStream,
    ) -> Result<(), TransportError> {
        let exchange = async {
            loop {
                match stream.recv().await? {
                    Some(Frame::Ping { probe: true }) => {
                        sink.send(Frame::Pong { probe: true }).await?;
                    }
                    Some(Frame::Upgrade) => return Ok(()),
                    Some(other) => {
                        debug!(frame = ?other.frame_type(), "Unexpected frame during upgrade");
                    }
                    None => return Err(TransportError::ConnectionClosed),
                }
            }
        };

        tokio::time::timeout(self.inner.config.ping_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Close a session. Returns `false` if it was already gone.
    ///
    /// The handler's `on_close` runs exactly once per session.
    pub async fn close(&self, sid: &SessionId, reason: CloseReason) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(sid) else {
            return false;
        };
        session.cancel.cancel();
        info!(session = %sid, reason = %reason, "Session closed");
        self.inner.handler.on_close(sid, reason).await;
        true
    }

    /// Close every session with `ServerShutdown`.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(sessions = ids.len(), "Closing all sessions");
        for id in ids {
            self.close(&id, CloseReason::ServerShutdown).await;
        }
    }
}

async fn dispatch_loop(
    handler: Arc<dyn EngineHandler>,
    sid: SessionId,
    mut queued: mpsc::Receiver<Packet>,
) {
    while let Some(packet) = queued.recv().await {
        handler.on_message(&sid, packet).await;
    }
}

async fn write_loop(session: Arc<Session>, mut sink: Box<dyn FrameSink>) {
    let mut rx = session.rx.lock().await;
    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(session = %session.id, error = %e, "WebSocket write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sink.send(Frame::Close).await;
    let _ = sink.close().await;
}
