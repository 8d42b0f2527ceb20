//! Node lifecycle and coordination.
//!
//! [`App`] ties the pieces together: it creates the local identity, seeds the
//! peer registry from disk, runs the session manager and turns manager
//! callbacks into [`AppEvent`]s on a channel the caller drains.

use crate::{
    crypto::{Ed25519IdentityProvider, IdentityProvider, KeyPair},
    network::{FilePeerStore, PeerInfo, PeerRegistry, PeerStore},
    session::{SessionId, SessionManager},
    transport::{parse_peer_list, Message, MessageType},
    utils::{parse_peer_address, NodeConfig, Result},
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Main application structure
pub struct App {
    /// Node configuration
    config: NodeConfig,
    /// Local key pair
    identity: KeyPair,
    /// Local peer record
    local: PeerInfo,
    /// Known peers
    registry: PeerRegistry,
    /// Sessions to remote peers
    manager: SessionManager,
    /// Peer persistence
    store: FilePeerStore,
    /// Receiver for events produced by manager callbacks
    event_receiver: Option<mpsc::UnboundedReceiver<AppEvent>>,
}

/// Application events
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Message received from an established peer
    MessageReceived {
        /// Sender
        peer_id: String,
        /// Received frame
        message: Message,
    },
    /// Peer completed a handshake
    PeerConnected {
        /// Remote peer id
        peer_id: String,
    },
    /// Peer's session ended
    PeerDisconnected {
        /// Remote peer id
        peer_id: String,
    },
}

impl App {
    /// Create a node with a fresh Ed25519 identity
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_provider(config, &Ed25519IdentityProvider::new())
    }

    /// Create a node whose identity comes from `provider`
    pub fn with_provider(config: NodeConfig, provider: &dyn IdentityProvider) -> Result<Self> {
        config.ensure_directories()?;

        let identity = provider.generate_key_pair();
        let peer_id = provider.derive_peer_id(&identity.public_key);
        let local = PeerInfo::new(
            peer_id,
            config.network.listen_address.clone(),
            config.network.listen_port,
            identity.public_key.clone(),
        );

        let registry = PeerRegistry::new();
        registry.set_local(local.clone())?;

        let store = FilePeerStore::new(config.storage.peers_path());
        let seeded = registry.seed(store.load_all()?);
        if seeded > 0 {
            log::info!("Loaded {} known peers from {}", seeded, store.path().display());
        }

        let manager = SessionManager::new(registry.clone(), config.network.listen_address.clone());
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let sender = event_sender.clone();
        manager.set_message_handler(move |peer_id, message| {
            let _ = sender.send(AppEvent::MessageReceived {
                peer_id: peer_id.to_string(),
                message: message.clone(),
            });
        });
        manager.set_connection_handler(move |peer_id, connected| {
            let peer_id = peer_id.to_string();
            let event = if connected {
                AppEvent::PeerConnected { peer_id }
            } else {
                AppEvent::PeerDisconnected { peer_id }
            };
            let _ = event_sender.send(event);
        });

        Ok(Self {
            config,
            identity,
            local,
            registry,
            manager,
            store,
            event_receiver: Some(event_receiver),
        })
    }

    /// Start listening and dial the configured bootstrap peers.
    ///
    /// `port` overrides the configured listen port. Bootstrap failures are
    /// logged and do not fail the start.
    pub async fn start(&self, port: Option<u16>) -> Result<SocketAddr> {
        let port = port.unwrap_or(self.config.network.listen_port);
        let local_addr = self.manager.start(port).await?;
        log::info!("Node {} listening on {}", self.local.id, local_addr);

        for endpoint in &self.config.network.bootstrap_peers {
            if let Err(e) = self.connect_to(endpoint).await {
                log::warn!("Bootstrap peer {} unreachable: {}", endpoint, e);
            }
        }
        Ok(local_addr)
    }

    /// Dial a `host:port` endpoint
    pub async fn connect_to(&self, endpoint: &str) -> Result<SessionId> {
        let (host, port) = parse_peer_address(endpoint)?;
        self.manager.connect(&host, port).await
    }

    /// Send a text message to one peer
    pub fn send_text(&self, peer_id: &str, text: &str) -> Result<bool> {
        Ok(self.manager.send(peer_id, Message::text(text)?))
    }

    /// Send a text message to every connected peer
    pub fn broadcast_text(&self, text: &str) -> Result<usize> {
        Ok(self.manager.broadcast(&Message::text(text)?))
    }

    /// Take the event receiver. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AppEvent>> {
        self.event_receiver.take()
    }

    /// Log an event the way the node's console output presents it
    pub fn handle_event(&self, event: &AppEvent) {
        match event {
            AppEvent::MessageReceived { peer_id, message } => match message.message_type() {
                MessageType::Text => {
                    let text = message
                        .as_text()
                        .map_or_else(|| String::from_utf8_lossy(message.payload()).into_owned(), str::to_string);
                    log::info!("[{}] {}", peer_id, text);
                }
                MessageType::PeerList => match parse_peer_list(message.payload()) {
                    Ok(peers) => log::info!("Peer {} shared {} endpoints", peer_id, peers.len()),
                    Err(e) => log::warn!("Bad peer list from {}: {}", peer_id, e),
                },
                other => log::debug!("{} from {}", other.name(), peer_id),
            },
            AppEvent::PeerConnected { peer_id } => {
                log::info!("Connected to peer: {}", peer_id);
                if let Err(e) = self.manager.send_peer_list(peer_id) {
                    log::debug!("Could not share peers with {}: {}", peer_id, e);
                }
            }
            AppEvent::PeerDisconnected { peer_id } => {
                log::info!("Disconnected from peer: {}", peer_id);
            }
        }
    }

    /// Node statistics
    pub fn stats(&self) -> AppStats {
        AppStats {
            peer_id: self.local.id.clone(),
            listen_addr: self.manager.local_addr(),
            known_peers: self.registry.len(),
            connected_peers: self.manager.connected_peers().len(),
            pending_sessions: self.manager.pending_sessions(),
        }
    }

    /// Stop all sessions and save the known peers
    pub fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down node {}", self.local.id);
        self.manager.stop();
        self.store.save_all(&self.registry.export())
    }

    /// Local peer record
    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    /// Local key pair
    pub fn identity(&self) -> &KeyPair {
        &self.identity
    }

    /// Session manager
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Peer registry
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

/// Application statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Local peer id
    pub peer_id: String,
    /// Bound listener address, while running
    pub listen_addr: Option<SocketAddr>,
    /// Number of known peers
    pub known_peers: usize,
    /// Number of established sessions
    pub connected_peers: usize,
    /// Number of sessions waiting for a handshake
    pub pending_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.listen_address = "127.0.0.1".to_string();
        config.storage.data_dir = temp_dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_app_creation() {
        let temp_dir = TempDir::new().unwrap();
        let mut app = App::new(test_config(&temp_dir)).unwrap();

        assert_eq!(app.local_peer().id.len(), 16);
        assert_eq!(app.registry().local().unwrap().id, app.local_peer().id);
        assert!(app.take_events().is_some());
        assert!(app.take_events().is_none());

        let stats = app.stats();
        assert_eq!(stats.known_peers, 0);
        assert_eq!(stats.connected_peers, 0);
        assert!(stats.listen_addr.is_none());
    }

    #[tokio::test]
    async fn test_seeds_from_peer_store() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        FilePeerStore::new(config.storage.peers_path())
            .save_all(&[PeerInfo::new("0011223344556677", "10.1.1.1", 7000, vec![9])])
            .unwrap();

        let app = App::new(config).unwrap();
        let seeded = app.registry().get("0011223344556677").unwrap();
        assert_eq!(seeded.port, 7000);
        assert!(!seeded.is_connected);
    }

    #[tokio::test]
    async fn test_shutdown_saves_peers() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let peers_path = config.storage.peers_path();

        let app = App::new(config).unwrap();
        app.registry()
            .upsert(PeerInfo::new("8899aabbccddeeff", "127.0.0.1", 9000, vec![1, 2]));
        app.start(Some(0)).await.unwrap();
        app.shutdown().unwrap();

        let saved = FilePeerStore::new(peers_path).load_all().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, "8899aabbccddeeff");
        assert!(app.manager().is_stopped());
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_for_text_and_connection() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = App::new(test_config(&dir_a)).unwrap();
        let mut b = App::new(test_config(&dir_b)).unwrap();
        let mut events = b.take_events().unwrap();

        a.start(Some(0)).await.unwrap();
        let b_addr = b.start(Some(0)).await.unwrap();
        a.connect_to(&format!("127.0.0.1:{}", b_addr.port())).await.unwrap();

        match next_event(&mut events).await {
            AppEvent::PeerConnected { peer_id } => assert_eq!(peer_id, a.local_peer().id),
            other => panic!("unexpected event {other:?}"),
        }

        // wait for a to see the reply handshake before sending
        for _ in 0..250 {
            if a.manager().is_connected(&b.local_peer().id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(a.send_text(&b.local_peer().id, "hello b").unwrap());

        match next_event(&mut events).await {
            AppEvent::MessageReceived { peer_id, message } => {
                assert_eq!(peer_id, a.local_peer().id);
                assert_eq!(message.as_text(), Some("hello b"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        a.shutdown().unwrap();
        match next_event(&mut events).await {
            AppEvent::PeerDisconnected { peer_id } => assert_eq!(peer_id, a.local_peer().id),
            other => panic!("unexpected event {other:?}"),
        }
        b.shutdown().unwrap();
    }
}
