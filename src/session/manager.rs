//! Session manager: listener, dialing, handshake binding and fan-out.
//!
//! The manager owns every [`Session`] through a single table keyed by
//! [`SessionId`]. Sessions that have not completed a handshake live in the
//! pending set; established ones are additionally indexed by peer id. Session
//! tasks report back by id, so a session removed from the table is simply
//! ignored when its tasks wind down.
//!
//! At most one established session exists per peer. When a second one
//! completes its handshake, the two nodes converge on the same connection
//! without talking to each other: between sessions of opposite direction the
//! one dialed by the lower peer id wins, and a same-direction duplicate
//! replaces the older session.
//!
//! The losing connection may be closed by the remote before the winner's
//! handshake has arrived here. An established session that closes while a
//! pending session it would yield to is still open is held as a handover:
//! its loss is reported only if none of those pending sessions binds the peer.
//!
//! Registry updates happen under the table lock; callbacks run after it is
//! released.

use crate::network::{PeerInfo, PeerRegistry};
use crate::session::session::{
    Session, SessionEvents, SessionId, SessionRole, SessionStats,
};
use crate::transport::{HandshakePayload, Message, MessageType};
use crate::utils::{NetworkError, NodeError, Result, SessionError, Shutdown};
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Callback for messages received from established peers
pub type MessageHandler = Arc<dyn Fn(&str, &Message) + Send + Sync>;

/// Callback for peer connection changes, `true` on connect
pub type ConnectionHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Back-off after a failed `accept`
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<Session>>,
    pending: HashSet<SessionId>,
    peers: HashMap<String, SessionId>,
    /// Peers whose session closed while a preferred pending session could
    /// still take over, with the pending sessions being waited on
    handovers: HashMap<String, HashSet<SessionId>>,
}

impl SessionTable {
    /// Pending sessions that would replace `closing` if they bound `peer_id`.
    fn successors(&self, local_id: &str, peer_id: &str, closing: &Session) -> HashSet<SessionId> {
        self.pending
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|candidate| {
                candidate.role() != closing.role()
                    && candidate.remote_addr().ip() == closing.remote_addr().ip()
                    && keeps_candidate(local_id, peer_id, closing.role(), candidate.role())
            })
            .map(|candidate| candidate.id())
            .collect()
    }

    /// Drop `session_id` from every handover and return the peers left with
    /// nothing to wait for.
    fn settle(&mut self, session_id: SessionId) -> Vec<String> {
        let mut lost = Vec::new();
        self.handovers.retain(|peer_id, waiting| {
            waiting.remove(&session_id);
            if waiting.is_empty() {
                lost.push(peer_id.clone());
                false
            } else {
                true
            }
        });
        lost
    }
}

struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

struct ManagerInner {
    registry: PeerRegistry,
    listen_address: String,
    table: Mutex<SessionTable>,
    listener: Mutex<Option<Listener>>,
    message_handler: RwLock<Option<MessageHandler>>,
    connection_handler: RwLock<Option<ConnectionHandler>>,
    shutdown: Shutdown,
}

/// Owns all sessions of the local node.
///
/// Cheap to clone; clones drive the same node. A stopped manager cannot be
/// started again.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager that will listen on `listen_address`.
    ///
    /// The registry's local peer must be set before [`start`](Self::start)
    /// or [`connect`](Self::connect) are called.
    pub fn new(registry: PeerRegistry, listen_address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                listen_address: listen_address.into(),
                table: Mutex::new(SessionTable::default()),
                listener: Mutex::new(None),
                message_handler: RwLock::new(None),
                connection_handler: RwLock::new(None),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Peer registry shared with this manager
    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Port 0 picks an ephemeral port; the bound address is returned.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let local = self.inner.require_local()?;
        self.inner.require_running()?;
        if self.local_addr().is_some() {
            return Err(SessionError::AlreadyRunning.into());
        }

        let address = format!("{}:{}", self.inner.listen_address, port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| NetworkError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| NetworkError::Bind {
            address: address.clone(),
            reason: e.to_string(),
        })?;

        let mut slot = self.inner.lock_listener();
        if slot.is_some() {
            return Err(SessionError::AlreadyRunning.into());
        }
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.inner)));
        *slot = Some(Listener { local_addr, task });

        info!("Listening on {} as peer {}", local_addr, local.short_id());
        Ok(local_addr)
    }

    /// Stop listening and close every session. Idempotent.
    ///
    /// Each established peer is reported disconnected exactly once.
    pub fn stop(&self) {
        let first = !self.inner.shutdown.is_triggered();
        self.inner.shutdown.trigger();

        if let Some(listener) = self.inner.lock_listener().take() {
            listener.task.abort();
        }

        let lost: Vec<String> = {
            let mut table = self.inner.lock_table();
            table.pending.clear();
            table.peers.clear();
            let mut lost: Vec<String> = table
                .sessions
                .drain()
                .filter_map(|(_, session)| session.close())
                .collect();
            lost.extend(table.handovers.drain().map(|(peer_id, _)| peer_id));
            self.inner.registry.disconnect_all();
            lost
        };
        self.inner.report_lost(&lost);

        if first {
            info!("Session manager stopped");
        }
    }

    /// Dial `address:port` and open an outbound session.
    ///
    /// Returns once the TCP connection is up and our handshake is queued;
    /// the peer becomes visible in [`connected_peers`](Self::connected_peers)
    /// after its handshake arrives.
    pub async fn connect(&self, address: &str, port: u16) -> Result<SessionId> {
        self.inner.require_local()?;
        self.inner.require_running()?;

        let mut signal = self.inner.shutdown.to_signal();
        let dialed = tokio::select! {
            _ = signal.wait() => return Err(SessionError::Stopped.into()),
            dialed = dial(address, port) => dialed?,
        };
        let (stream, remote_addr) = dialed;

        info!("Connected to {}:{} ({})", address, port, remote_addr);
        self.inner.open_session(
            stream,
            remote_addr,
            SessionRole::Outbound,
            Some((address.to_string(), port)),
        )
    }

    /// Close the session bound to `peer_id` and report it disconnected.
    ///
    /// Does nothing if the peer is not connected.
    pub fn disconnect(&self, peer_id: &str) {
        let lost = {
            let mut table = self.inner.lock_table();
            let lost = if let Some(session_id) = table.peers.remove(peer_id) {
                table
                    .sessions
                    .remove(&session_id)
                    .and_then(|session| session.close())
            } else if table.handovers.remove(peer_id).is_some() {
                Some(peer_id.to_string())
            } else {
                debug!("Disconnect requested for unknown peer {}", peer_id);
                return;
            };
            let lost: Vec<String> = lost.into_iter().collect();
            self.inner.mark_lost(&lost);
            lost
        };
        if !lost.is_empty() {
            info!("Disconnected from {}", peer_id);
        }
        self.inner.report_lost(&lost);
    }

    /// Queue `message` for `peer_id`.
    ///
    /// Returns `false` without error if the peer has no established session.
    pub fn send(&self, peer_id: &str, message: Message) -> bool {
        let Some(session) = self.inner.established(peer_id) else {
            debug!("Not sending {} to unknown peer {}", message.message_type().name(), peer_id);
            return false;
        };
        match session.send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", peer_id, e);
                false
            }
        }
    }

    /// Queue `message` on every established session.
    ///
    /// Failures on one session do not affect the others. Returns the number
    /// of sessions the message was queued on.
    pub fn broadcast(&self, message: &Message) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let table = self.inner.lock_table();
            table
                .peers
                .values()
                .filter_map(|id| table.sessions.get(id).cloned())
                .collect()
        };

        let mut delivered = 0;
        for session in sessions {
            match session.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast skipped session {}: {}", session.id(), e),
            }
        }
        trace!(
            "Broadcast {} frame to {} peers",
            message.message_type().name(),
            delivered
        );
        delivered
    }

    /// Send `peer_id` the endpoints of every other known peer.
    pub fn send_peer_list(&self, peer_id: &str) -> Result<bool> {
        let endpoints: Vec<String> = self
            .inner
            .registry
            .export()
            .iter()
            .filter(|peer| peer.id != peer_id)
            .map(PeerInfo::endpoint)
            .collect();
        let message = Message::peer_list(&endpoints)?;
        Ok(self.send(peer_id, message))
    }

    /// Replace the message callback.
    ///
    /// Called from session tasks, one message at a time per session; keep it short.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &Message) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .message_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(handler));
    }

    /// Replace the connection callback
    pub fn set_connection_handler<F>(&self, handler: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .connection_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(handler));
    }

    /// Peer ids with an established session, sorted
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.lock_table().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Whether `peer_id` has an established session
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.lock_table().peers.contains_key(peer_id)
    }

    /// Number of sessions still waiting for a handshake
    pub fn pending_sessions(&self) -> usize {
        self.inner.lock_table().pending.len()
    }

    /// Number of sessions owned by the manager
    pub fn session_count(&self) -> usize {
        self.inner.lock_table().sessions.len()
    }

    /// Snapshot of every owned session
    pub fn stats(&self) -> Vec<SessionStats> {
        self.inner
            .lock_table()
            .sessions
            .values()
            .map(|session| session.stats())
            .collect()
    }

    /// Bound listener address, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock_listener().as_ref().map(|l| l.local_addr)
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

impl ManagerInner {
    fn require_local(&self) -> Result<PeerInfo> {
        self.registry
            .local()
            .ok_or_else(|| SessionError::LocalPeerMissing.into())
    }

    fn require_running(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(SessionError::Stopped.into());
        }
        Ok(())
    }

    fn lock_table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn message_handler(&self) -> Option<MessageHandler> {
        self.message_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn connection_handler(&self) -> Option<ConnectionHandler> {
        self.connection_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.lock_table().sessions.get(&session_id).cloned()
    }

    fn is_bound(&self, peer_id: &str, session_id: SessionId) -> bool {
        self.lock_table().peers.get(peer_id) == Some(&session_id)
    }

    fn established(&self, peer_id: &str) -> Option<Arc<Session>> {
        let table = self.lock_table();
        table
            .peers
            .get(peer_id)
            .and_then(|id| table.sessions.get(id))
            .cloned()
    }

    /// Register a connected stream and spawn its tasks.
    fn open_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        role: SessionRole,
        dialed: Option<(String, u16)>,
    ) -> Result<SessionId> {
        let (session, io) = Session::new(role, stream, remote_addr, dialed);
        let session_id = session.id();

        if role == SessionRole::Outbound {
            let local = self.require_local()?;
            session.begin_handshake(Message::handshake(&local.id, &local.public_key)?)?;
        }

        {
            let mut table = self.lock_table();
            if self.shutdown.is_triggered() {
                return Err(SessionError::Stopped.into());
            }
            table.sessions.insert(session_id, Arc::clone(&session));
            table.pending.insert(session_id);
        }

        debug!("Session {} opened ({:?}, {})", session_id, role, remote_addr);
        let events: Arc<dyn SessionEvents> = Arc::clone(self) as Arc<dyn SessionEvents>;
        session.start(io, events, self.shutdown.to_signal());
        Ok(session_id)
    }

    fn complete_handshake(&self, session: &Arc<Session>, message: &Message) -> Result<()> {
        let handshake = HandshakePayload::parse(message.payload())?;
        let local = self.require_local()?;
        if handshake.peer_id == local.id {
            warn!("Session {} presented our own peer id", session.id());
            return Err(SessionError::SelfConnection.into());
        }
        let peer_id = handshake.peer_id;

        let (resumed, lost) = {
            let mut table = self.lock_table();
            if !table.sessions.contains_key(&session.id()) {
                // closed while the frame was in flight
                return Ok(());
            }

            let existing = table
                .peers
                .get(&peer_id)
                .and_then(|id| table.sessions.get(id))
                .cloned();
            if let Some(existing) = existing {
                if !keeps_candidate(&local.id, &peer_id, existing.role(), session.role()) {
                    info!(
                        "Keeping session {} for {}, dropping duplicate {}",
                        existing.id(),
                        peer_id,
                        session.id()
                    );
                    table.sessions.remove(&session.id());
                    table.pending.remove(&session.id());
                    session.close();
                    let lost = table.settle(session.id());
                    self.mark_lost(&lost);
                    drop(table);
                    self.report_lost(&lost);
                    return Ok(());
                }

                info!(
                    "Session {} replaces {} for {}",
                    session.id(),
                    existing.id(),
                    peer_id
                );
                table.sessions.remove(&existing.id());
                // the peer stays connected, so the replaced session reports nothing
                existing.close();
            }

            session.bind_peer(&peer_id)?;
            table.pending.remove(&session.id());
            table.peers.insert(peer_id.clone(), session.id());
            let resumed = table.handovers.remove(&peer_id).is_some();
            let lost = table.settle(session.id());

            let (address, port) = Self::peer_endpoint(session);
            let mut peer = PeerInfo::new(peer_id.clone(), address, port, handshake.public_key);
            peer.is_connected = true;
            self.registry.upsert(peer);
            self.mark_lost(&lost);
            (resumed, lost)
        };
        self.report_lost(&lost);

        if resumed {
            info!("Peer {} moved to session {}", peer_id, session.id());
        } else {
            info!(
                "Peer {} connected ({:?}, {})",
                peer_id,
                session.role(),
                session.remote_addr()
            );
            // a disconnect or stop may have run since the lock was released
            if self.is_bound(&peer_id, session.id()) {
                if let Some(handler) = self.connection_handler() {
                    handler(&peer_id, true);
                }
            }
        }

        if session.role() == SessionRole::Inbound {
            session.send(Message::handshake(&local.id, &local.public_key)?)?;
        }
        Ok(())
    }

    /// Address to record for a newly bound peer: what was dialed for
    /// outbound sessions, the remote socket address for inbound ones.
    fn peer_endpoint(session: &Session) -> (String, u16) {
        session.dialed().unwrap_or_else(|| {
            let remote = session.remote_addr();
            (remote.ip().to_string(), remote.port())
        })
    }

    /// Registry side of losing peers; called with the table lock held.
    fn mark_lost(&self, lost: &[String]) {
        for peer_id in lost {
            self.registry.set_connected(peer_id, false);
        }
    }

    fn report_lost(&self, lost: &[String]) {
        let handler = self.connection_handler();
        for peer_id in lost {
            info!("Peer {} disconnected", peer_id);
            if let Some(handler) = &handler {
                handler(peer_id, false);
            }
        }
    }
}

impl SessionEvents for ManagerInner {
    fn on_frame(&self, session_id: SessionId, message: Message) -> Result<()> {
        let Some(session) = self.session(session_id) else {
            return Ok(());
        };

        let Some(peer_id) = session.peer_id() else {
            if message.message_type() == MessageType::Handshake {
                return self.complete_handshake(&session, &message);
            }
            debug!(
                "Dropping {} frame on session {} before handshake",
                message.message_type().name(),
                session_id
            );
            return Ok(());
        };

        match message.message_type() {
            MessageType::Handshake => {
                debug!("Ignoring repeated handshake from {}", peer_id);
                return Ok(());
            }
            MessageType::Unrecognized(code) => {
                debug!("Dropping frame with unknown type {} from {}", code, peer_id);
                return Ok(());
            }
            MessageType::Ping => {
                if let Err(e) = session.send(Message::pong()) {
                    debug!("Could not answer ping from {}: {}", peer_id, e);
                }
            }
            MessageType::Text | MessageType::PeerList | MessageType::Pong => {}
        }

        if let Some(handler) = self.message_handler() {
            handler(&peer_id, &message);
        }
        Ok(())
    }

    fn on_closed(&self, session_id: SessionId, reason: Option<NodeError>) {
        let lost = {
            let mut table = self.lock_table();
            let Some(session) = table.sessions.remove(&session_id) else {
                return;
            };
            table.pending.remove(&session_id);
            if let Some(peer_id) = session.peer_id() {
                if table.peers.get(&peer_id) == Some(&session_id) {
                    table.peers.remove(&peer_id);
                }
            }

            let mut lost = table.settle(session_id);
            if let Some(peer_id) = session.close() {
                let successors = self
                    .registry
                    .local()
                    .map(|local| table.successors(&local.id, &peer_id, &session))
                    .unwrap_or_default();
                if successors.is_empty() {
                    lost.push(peer_id);
                } else {
                    debug!(
                        "Holding loss of {} for {} pending sessions",
                        peer_id,
                        successors.len()
                    );
                    table.handovers.insert(peer_id, successors);
                }
            }
            self.mark_lost(&lost);
            lost
        };

        match &reason {
            Some(e) if e.is_connection_closed() => debug!("Session {} closed by remote", session_id),
            Some(e) => warn!("Session {} closed: {}", session_id, e),
            None => debug!("Session {} closed", session_id),
        }

        self.report_lost(&lost);
    }
}

/// Whether a freshly handshaken session should take over from the one
/// already bound to the same peer.
///
/// Both nodes evaluate this with the ids swapped and the roles mirrored, so
/// they always keep the same TCP connection.
fn keeps_candidate(
    local_id: &str,
    peer_id: &str,
    existing: SessionRole,
    candidate: SessionRole,
) -> bool {
    if existing == candidate {
        return true;
    }
    let preferred = if local_id < peer_id {
        SessionRole::Outbound
    } else {
        SessionRole::Inbound
    };
    candidate == preferred
}

async fn dial(address: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((address, port))
        .await
        .map_err(|e| NetworkError::Resolution {
            host: address.to_string(),
            reason: e.to_string(),
        })?
        .collect();
    if resolved.is_empty() {
        return Err(NetworkError::Resolution {
            host: address.to_string(),
            reason: "no addresses found".to_string(),
        }
        .into());
    }

    let mut last_error = String::new();
    for candidate in resolved {
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok((stream, candidate)),
            Err(e) => {
                debug!("Dial {} failed: {}", candidate, e);
                last_error = e.to_string();
            }
        }
    }

    Err(NetworkError::ConnectionFailed {
        peer: format!("{address}:{port}"),
        reason: last_error,
    }
    .into())
}

async fn accept_loop(listener: TcpListener, inner: Arc<ManagerInner>) {
    let mut signal = inner.shutdown.to_signal();
    loop {
        let accepted = tokio::select! {
            _ = signal.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote_addr)) => {
                debug!("Accepted connection from {}", remote_addr);
                if let Err(e) =
                    inner.open_session(stream, remote_addr, SessionRole::Inbound, None)
                {
                    debug!("Dropping connection from {}: {}", remote_addr, e);
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::select! {
                    _ = signal.wait() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("Accept loop stopped");
}
