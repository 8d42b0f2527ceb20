//! Error types and handling for the peer-to-peer node.
//!
//! Every layer reports failures through [`NodeError`], which wraps one
//! sub-enum per concern. Per-session protocol and transport errors never
//! escape the session that produced them; only bind, resolution and dial
//! failures are returned to callers.

use thiserror::Error;

/// Result type alias for the node library
pub type Result<T> = std::result::Result<T, NodeError>;

/// Top-level error type for all node operations
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    /// Wire format and payload parsing errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Listener, dial and transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Identity provider errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Peer persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a frame header
    #[error("Frame too short: {len} bytes (header is {header} bytes)")]
    FrameTooShort {
        /// Bytes available
        len: usize,
        /// Required header size
        header: usize,
    },

    /// Declared payload length is truncated or over the transport cap
    #[error("Payload size mismatch: header declares {declared} bytes, {reason}")]
    PayloadSizeMismatch {
        /// Length from the header
        declared: usize,
        /// Underlying cause
        reason: String,
    },

    /// Handshake payload could not be parsed
    #[error("Malformed handshake: {reason}")]
    MalformedHandshake {
        /// Underlying cause
        reason: String,
    },

    /// Peer list payload could not be parsed
    #[error("Malformed peer list: {reason}")]
    MalformedPeerList {
        /// Underlying cause
        reason: String,
    },
}

/// Listener, dial and transport errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Listening endpoint could not be bound
    #[error("Failed to bind {address}: {reason}")]
    Bind {
        /// Offending address
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Host name did not resolve to any address
    #[error("Failed to resolve {host}: {reason}")]
    Resolution {
        /// Host that failed to resolve
        host: String,
        /// Underlying cause
        reason: String,
    },

    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed {
        /// Dialed endpoint
        peer: String,
        /// Underlying cause
        reason: String,
    },

    /// Mid-session read or write failure
    #[error("Transport error: {reason}")]
    Transport {
        /// Underlying cause
        reason: String,
    },

    /// Remote end closed the stream at a frame boundary
    #[error("Connection closed")]
    ConnectionClosed,

    /// Address string is not `host:port`
    #[error("Invalid address: {address}")]
    InvalidAddress {
        /// Offending address
        address: String,
    },
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// State the session was in
        state: String,
    },

    /// Session is closing or closed
    #[error("Session closed: {session_id}")]
    Closed {
        /// Closed session
        session_id: String,
    },

    /// Local peer record has not been set
    #[error("Local peer is not set")]
    LocalPeerMissing,

    /// Local peer record was already set
    #[error("Local peer already set")]
    LocalPeerAlreadySet,

    /// Manager is already listening
    #[error("Session manager already running")]
    AlreadyRunning,

    /// Manager has been stopped and cannot be restarted
    #[error("Session manager stopped")]
    Stopped,

    /// Remote presented our own peer id
    #[error("Handshake from self rejected")]
    SelfConnection,
}

/// Identity provider errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Underlying cause
        reason: String,
    },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation {
        /// Underlying cause
        reason: String,
    },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Configuration key
        field: String,
        /// Rejected value
        value: String,
    },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// File or directory path
        path: String,
    },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError {
        /// Underlying cause
        reason: String,
    },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        /// File or directory path
        path: String,
    },
}

/// Peer persistence errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Peer file could not be read
    #[error("Failed to read {path}: {reason}")]
    Read {
        /// File or directory path
        path: String,
        /// Underlying cause
        reason: String,
    },

    /// Peer file could not be written
    #[error("Failed to write {path}: {reason}")]
    Write {
        /// File or directory path
        path: String,
        /// Underlying cause
        reason: String,
    },
}

impl NodeError {
    /// Returns true if the error only affects a single session
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Network(NetworkError::Transport { .. })
                | Self::Network(NetworkError::ConnectionClosed)
                | Self::Session(SessionError::Closed { .. })
                | Self::Session(SessionError::SelfConnection)
        )
    }

    /// Returns true for a clean end of stream
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::Network(NetworkError::ConnectionClosed))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for NodeError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Crypto(CryptoError::InvalidKey {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = NodeError::Protocol(ProtocolError::FrameTooShort { len: 4, header: 13 });
        assert!(error.to_string().contains("Frame too short"));

        let error = NodeError::Network(NetworkError::Bind {
            address: "0.0.0.0:8080".to_string(),
            reason: "address in use".to_string(),
        });
        assert!(error.to_string().contains("0.0.0.0:8080"));
    }

    #[test]
    fn test_session_local_errors() {
        let decode_error: NodeError = ProtocolError::MalformedHandshake {
            reason: "empty".to_string(),
        }
        .into();
        assert!(decode_error.is_session_local());

        let bind_error: NodeError = NetworkError::Bind {
            address: "127.0.0.1:1".to_string(),
            reason: "denied".to_string(),
        }
        .into();
        assert!(!bind_error.is_session_local());
    }

    #[test]
    fn test_connection_closed() {
        let closed: NodeError = NetworkError::ConnectionClosed.into();
        assert!(closed.is_connection_closed());
        assert!(closed.is_session_local());

        let io: NodeError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(!io.is_connection_closed());
    }
}
