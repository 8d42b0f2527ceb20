//! Peer bookkeeping: the live registry and its on-disk companion.

pub mod persistence;
pub mod registry;

pub use persistence::{FilePeerStore, PeerStore};
pub use registry::{PeerInfo, PeerRegistry};
