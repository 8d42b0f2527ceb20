//! # P2P Chat Node
//!
//! A peer-to-peer messaging node: every node listens for TCP connections,
//! dials other nodes, exchanges a handshake to learn the remote peer id and
//! then sends framed text messages to one peer or to all of them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2p_chat_node::{App, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::new(NodeConfig::default())?;
//!     app.start(None).await?;
//!     app.connect_to("localhost:8081").await?;
//!     app.broadcast_text("hello")?;
//!     app.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: frame codec and async frame I/O
//! - [`crypto`]: identity provider (key pairs and peer ids)
//! - [`network`]: peer registry and peer persistence
//! - [`session`]: per-connection state machine and the session manager
//! - [`utils`]: configuration, error handling and shutdown signalling
//! - [`app`]: wiring of all of the above into a runnable node

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{App, AppEvent};
pub use crypto::{Ed25519IdentityProvider, IdentityProvider, KeyPair};
pub use network::{PeerInfo, PeerRegistry};
pub use session::{SessionId, SessionManager};
pub use transport::{Message, MessageType};
pub use utils::{NodeConfig, NodeError, Result};

/// Default configuration values
pub mod defaults {
    /// Default port for peer connections
    pub const DEFAULT_PORT: u16 = 8080;

    /// Default listen address (all interfaces)
    pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

    /// Default peer list file name inside the data directory
    pub const DEFAULT_PEERS_FILE: &str = "peers.txt";
}
