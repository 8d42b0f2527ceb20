//! Peer list persistence.
//!
//! Peers are stored one per line as `id|address|port|hex public key`. Lines
//! that do not parse are skipped with a warning rather than failing the load.

use crate::network::PeerInfo;
use crate::utils::{Result, StorageError};
use log::{debug, warn};
use std::path::{Path, PathBuf};

const FIELD_SEPARATOR: char = '|';

/// Bulk save/load of known peers
pub trait PeerStore: Send + Sync {
    /// Replace the stored peers with `peers`
    fn save_all(&self, peers: &[PeerInfo]) -> Result<()>;

    /// Load every stored peer, all marked disconnected
    fn load_all(&self) -> Result<Vec<PeerInfo>>;
}

/// Flat-file peer store
#[derive(Debug, Clone)]
pub struct FilePeerStore {
    path: PathBuf,
}

impl FilePeerStore {
    /// Create a store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PeerStore for FilePeerStore {
    fn save_all(&self, peers: &[PeerInfo]) -> Result<()> {
        let content: String = peers.iter().map(|p| format_line(p) + "\n").collect();
        std::fs::write(&self.path, content).map_err(|e| StorageError::Write {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Saved {} peers to {}", peers.len(), self.path.display());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PeerInfo>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Read {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        let mut peers = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(peer) => peers.push(peer),
                None => warn!(
                    "Skipping malformed peer entry at {}:{}",
                    self.path.display(),
                    number + 1
                ),
            }
        }
        debug!("Loaded {} peers from {}", peers.len(), self.path.display());
        Ok(peers)
    }
}

fn format_line(peer: &PeerInfo) -> String {
    format!(
        "{id}{sep}{address}{sep}{port}{sep}{key}",
        id = peer.id,
        address = peer.address,
        port = peer.port,
        key = hex::encode(&peer.public_key),
        sep = FIELD_SEPARATOR
    )
}

fn parse_line(line: &str) -> Option<PeerInfo> {
    let mut fields = line.splitn(4, FIELD_SEPARATOR);
    let id = fields.next().filter(|id| !id.is_empty())?;
    let address = fields.next()?;
    let port = fields.next()?.parse::<u16>().ok()?;
    let public_key = hex::decode(fields.next()?).ok()?;

    Some(PeerInfo::new(id, address, port, public_key))
}
