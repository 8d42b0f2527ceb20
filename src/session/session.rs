//! A single connection to a remote endpoint.
//!
//! Each [`Session`] runs two tasks once started:
//!
//! - a reader that decodes one frame at a time and hands it to the
//!   [`SessionEvents`] sink, waiting for the sink to return before reading the
//!   next frame, and
//! - a writer that is the only consumer of the session's outbound queue, so
//!   frames are written one after another and never interleave on the stream.
//!
//! Both tasks race their I/O against the session's own shutdown and the
//! manager-wide one, so closing never waits on a silent peer.

use crate::transport::{read_frame, write_frame, Message};
use crate::utils::{NodeError, Result, SessionError, Shutdown, ShutdownSignal};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stable identifier of a session
pub type SessionId = Uuid;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent yet
    Connecting,
    /// Outbound: our handshake is queued, waiting for the peer's
    HandshakeSent,
    /// Inbound: waiting for the peer's handshake
    HandshakeAwaited,
    /// Bound to a peer id
    Established,
    /// Shutdown triggered, tasks winding down
    Closing,
    /// Both tasks have exited
    Closed,
}

impl SessionState {
    /// Whether the session can still carry traffic
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receiver of everything a session's tasks observe
pub trait SessionEvents: Send + Sync + 'static {
    /// A frame arrived. Returning an error closes the session.
    fn on_frame(&self, session_id: SessionId, message: Message) -> Result<()>;

    /// One of the session's tasks stopped; `reason` is `None` on a requested close.
    fn on_closed(&self, session_id: SessionId, reason: Option<NodeError>);
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    peer_id: Option<String>,
}

/// Transport and queue receiver handed to [`Session::start`]
pub struct SessionIo {
    stream: TcpStream,
    queue: mpsc::UnboundedReceiver<Message>,
}

/// Protocol state for one connection
pub struct Session {
    id: SessionId,
    role: SessionRole,
    remote_addr: SocketAddr,
    dialed: Option<(String, u16)>,
    status: Mutex<Status>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: Shutdown,
    live_tasks: AtomicUsize,
    created_at: DateTime<Utc>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Session identifier
    pub session_id: SessionId,
    /// Connection direction
    pub role: SessionRole,
    /// State when the snapshot was taken
    pub state: SessionState,
    /// Bound peer, if any
    pub peer_id: Option<String>,
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// When the connection was opened
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.lock_status();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("state", &status.state)
            .field("peer_id", &status.peer_id)
            .finish()
    }
}

impl Session {
    /// Wrap a connected stream.
    ///
    /// `dialed` is the `(host, port)` the caller asked for on outbound
    /// connections; it is what gets recorded for the peer instead of the
    /// resolved socket address.
    pub fn new(
        role: SessionRole,
        stream: TcpStream,
        remote_addr: SocketAddr,
        dialed: Option<(String, u16)>,
    ) -> (Arc<Self>, SessionIo) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let state = match role {
            SessionRole::Inbound => SessionState::HandshakeAwaited,
            SessionRole::Outbound => SessionState::Connecting,
        };

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            role,
            remote_addr,
            dialed,
            status: Mutex::new(Status {
                state,
                peer_id: None,
            }),
            outbound,
            shutdown: Shutdown::new(),
            live_tasks: AtomicUsize::new(0),
            created_at: Utc::now(),
        });

        (session, SessionIo { stream, queue })
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection direction
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Remote socket address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Host and port the caller dialed, for outbound sessions
    pub fn dialed(&self) -> Option<(String, u16)> {
        self.dialed.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock_status().state
    }

    /// Bound peer id, once the handshake completed
    pub fn peer_id(&self) -> Option<String> {
        self.lock_status().peer_id.clone()
    }

    /// Snapshot for diagnostics
    pub fn stats(&self) -> SessionStats {
        let status = self.lock_status();
        SessionStats {
            session_id: self.id,
            role: self.role,
            state: status.state,
            peer_id: status.peer_id.clone(),
            remote_addr: self.remote_addr,
            created_at: self.created_at,
        }
    }

    /// Whether the session is neither closing nor closed
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Queue the outbound handshake as the first frame and move to `HandshakeSent`.
    pub fn begin_handshake(&self, handshake: Message) -> Result<()> {
        let mut status = self.lock_status();
        if status.state != SessionState::Connecting {
            return Err(SessionError::InvalidState {
                state: status.state.to_string(),
            }
            .into());
        }
        self.enqueue(handshake)?;
        status.state = SessionState::HandshakeSent;
        Ok(())
    }

    /// Bind the session to a peer id and mark it established.
    pub fn bind_peer(&self, peer_id: &str) -> Result<()> {
        let mut status = self.lock_status();
        match status.state {
            SessionState::HandshakeSent | SessionState::HandshakeAwaited if status.peer_id.is_none() => {
                status.peer_id = Some(peer_id.to_string());
                status.state = SessionState::Established;
                Ok(())
            }
            state => Err(SessionError::InvalidState {
                state: state.to_string(),
            }
            .into()),
        }
    }

    /// Queue a message for the writer task.
    ///
    /// Never writes directly; concurrent callers are serialized by the queue.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_live() {
            return Err(self.closed_error());
        }
        self.enqueue(message)
    }

    fn enqueue(&self, message: Message) -> Result<()> {
        self.outbound.send(message).map_err(|_| self.closed_error())
    }

    /// Close the session. Idempotent.
    ///
    /// Returns the peer id only for the call that took an `Established`
    /// session into `Closing`, so exactly one caller reports the loss.
    pub fn close(&self) -> Option<String> {
        let lost = {
            let mut status = self.lock_status();
            if !status.state.is_live() {
                return None;
            }
            let was_established = status.state == SessionState::Established;
            status.state = SessionState::Closing;
            if was_established {
                status.peer_id.clone()
            } else {
                None
            }
        };
        self.shutdown.trigger();
        trace!("Session {} closing", self.id);
        lost
    }

    /// Spawn the reader and writer tasks.
    pub fn start(
        self: &Arc<Self>,
        io: SessionIo,
        events: Arc<dyn SessionEvents>,
        manager_signal: ShutdownSignal,
    ) {
        let SessionIo { stream, queue } = io;
        let (reader, writer) = stream.into_split();
        self.live_tasks.store(2, Ordering::Release);

        let session = Arc::clone(self);
        let reader_events = Arc::clone(&events);
        let reader_signal = manager_signal.clone();
        tokio::spawn(async move {
            session.read_loop(reader, reader_events, reader_signal).await;
        });

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.write_loop(writer, queue, events, manager_signal).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        events: Arc<dyn SessionEvents>,
        mut manager_signal: ShutdownSignal,
    ) {
        let mut own_signal = self.shutdown.to_signal();
        let reason = loop {
            let frame = tokio::select! {
                _ = own_signal.wait() => break None,
                _ = manager_signal.wait() => break None,
                frame = read_frame(&mut reader) => frame,
            };

            match frame {
                Ok(message) => {
                    trace!(
                        "Session {} received {} frame ({} bytes)",
                        self.id,
                        message.message_type().name(),
                        message.payload().len()
                    );
                    if let Err(e) = events.on_frame(self.id, message) {
                        break Some(e);
                    }
                }
                Err(e) => break Some(e),
            }
        };

        debug!("Session {} reader stopped", self.id);
        events.on_closed(self.id, reason);
        self.task_exited();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Message>,
        events: Arc<dyn SessionEvents>,
        mut manager_signal: ShutdownSignal,
    ) {
        let mut own_signal = self.shutdown.to_signal();
        let reason = loop {
            let message = tokio::select! {
                _ = own_signal.wait() => break None,
                _ = manager_signal.wait() => break None,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break None,
                },
            };

            let written = tokio::select! {
                _ = own_signal.wait() => break None,
                _ = manager_signal.wait() => break None,
                written = write_frame(&mut writer, &message) => written,
            };
            if let Err(e) = written {
                break Some(e);
            }
        };

        // Half-close so the remote reader sees EOF even while our read half lingers.
        let _ = writer.shutdown().await;
        debug!("Session {} writer stopped", self.id);
        events.on_closed(self.id, reason);
        self.task_exited();
    }

    fn task_exited(&self) {
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut status = self.lock_status();
            status.state = SessionState::Closed;
        }
    }

    fn closed_error(&self) -> NodeError {
        SessionError::Closed {
            session_id: self.id.to_string(),
        }
        .into()
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageType;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Message>>,
        closed: Mutex<Vec<Option<String>>>,
        fail_on_ping: bool,
    }

    impl SessionEvents for Recorder {
        fn on_frame(&self, _session_id: SessionId, message: Message) -> Result<()> {
            if self.fail_on_ping && message.message_type() == MessageType::Ping {
                return Err(SessionError::InvalidState {
                    state: "test".to_string(),
                }
                .into());
            }
            self.frames.lock().unwrap().push(message);
            Ok(())
        }

        fn on_closed(&self, _session_id: SessionId, reason: Option<NodeError>) {
            self.closed.lock().unwrap().push(reason.map(|e| e.to_string()));
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_initial_states() {
        let (a, b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (inbound, _io) = Session::new(SessionRole::Inbound, a, addr, None);
        assert_eq!(inbound.state(), SessionState::HandshakeAwaited);

        let (outbound, _io) = Session::new(SessionRole::Outbound, b, addr, Some(("localhost".to_string(), 1)));
        assert_eq!(outbound.state(), SessionState::Connecting);
        outbound.begin_handshake(Message::handshake("me", &[1]).unwrap()).unwrap();
        assert_eq!(outbound.state(), SessionState::HandshakeSent);
        assert!(outbound.begin_handshake(Message::ping()).is_err());
        assert_eq!(outbound.dialed(), Some(("localhost".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_bind_and_close_reports_peer_once() {
        let (a, _b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, _io) = Session::new(SessionRole::Inbound, a, addr, None);

        session.bind_peer("peer-1").unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert!(session.bind_peer("peer-2").is_err());

        let stats = session.stats();
        assert_eq!(stats.peer_id.as_deref(), Some("peer-1"));
        assert_eq!(stats.role, SessionRole::Inbound);

        assert_eq!(session.close(), Some("peer-1".to_string()));
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.close(), None);
        assert!(session.send(Message::ping()).is_err());
    }

    #[tokio::test]
    async fn test_close_before_handshake_reports_nothing() {
        let (a, _b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, _io) = Session::new(SessionRole::Inbound, a, addr, None);
        assert_eq!(session.close(), None);
        assert!(session.bind_peer("late").is_err());
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (a, mut b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, io) = Session::new(SessionRole::Inbound, a, addr, None);
        let recorder = Arc::new(Recorder::default());
        let manager = Shutdown::new();
        session.start(io, recorder.clone(), manager.to_signal());

        for i in 0..20 {
            write_frame(&mut b, &Message::text(&format!("msg-{i}")).unwrap())
                .await
                .unwrap();
        }

        assert!(eventually(|| recorder.frames.lock().unwrap().len() == 20).await);
        let texts: Vec<String> = recorder
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.as_text().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
        assert_eq!(texts, expected);
        manager.trigger();
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (a, mut b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, io) = Session::new(SessionRole::Outbound, a, addr, None);
        let manager = Shutdown::new();
        session.start(io, Arc::new(Recorder::default()), manager.to_signal());

        let senders: Vec<_> = (0..8)
            .map(|t| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    for i in 0..25 {
                        let payload = vec![t as u8; 1000 + i];
                        session
                            .send(Message::new(MessageType::Text, payload).unwrap())
                            .unwrap();
                    }
                })
            })
            .collect();
        for joined in futures::future::join_all(senders).await {
            joined.unwrap();
        }

        let mut per_sender = [0usize; 8];
        for _ in 0..200 {
            let message = read_frame(&mut b).await.unwrap();
            let payload = message.payload();
            let tag = payload[0];
            assert!(payload.iter().all(|byte| *byte == tag), "frame bytes interleaved");
            assert_eq!(payload.len(), 1000 + per_sender[tag as usize]);
            per_sender[tag as usize] += 1;
        }
        assert!(per_sender.iter().all(|count| *count == 25));
        manager.trigger();
    }

    #[tokio::test]
    async fn test_remote_eof_closes_session() {
        let (a, b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, io) = Session::new(SessionRole::Inbound, a, addr, None);
        let recorder = Arc::new(Recorder::default());
        let manager = Shutdown::new();
        session.start(io, recorder.clone(), manager.to_signal());

        drop(b);
        assert!(eventually(|| !recorder.closed.lock().unwrap().is_empty()).await);
        let first = recorder.closed.lock().unwrap()[0].clone();
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn test_handler_error_closes_reader() {
        let (a, mut b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, io) = Session::new(SessionRole::Inbound, a, addr, None);
        let recorder = Arc::new(Recorder {
            fail_on_ping: true,
            ..Recorder::default()
        });
        let manager = Shutdown::new();
        session.start(io, recorder.clone(), manager.to_signal());

        write_frame(&mut b, &Message::ping()).await.unwrap();
        assert!(eventually(|| !recorder.closed.lock().unwrap().is_empty()).await);
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_tasks() {
        let (a, mut b) = tcp_pair().await;
        let addr = a.peer_addr().unwrap();
        let (session, io) = Session::new(SessionRole::Inbound, a, addr, None);
        let recorder = Arc::new(Recorder::default());
        let manager = Shutdown::new();
        session.start(io, recorder.clone(), manager.to_signal());

        // the remote never writes; close must not wait for it
        session.close();
        assert!(eventually(|| session.state() == SessionState::Closed).await);
        assert_eq!(recorder.closed.lock().unwrap().len(), 2);
        assert!(recorder.closed.lock().unwrap().iter().all(Option::is_none));

        // remote sees the stream end
        let result = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut b))
            .await
            .unwrap();
        assert!(result.is_err());
    }
}
