//! Message protocol definitions and binary framing.
//!
//! Every frame is a fixed 13-byte header followed by the payload:
//!
//! ```text
//! [type: u8][payload length: u32 BE][timestamp ms: i64 BE][payload ...]
//! ```
//!
//! Handshake and peer-list payloads carry their own small length-prefixed
//! layouts, built and parsed by the helpers at the bottom of this module.

use crate::utils::{ProtocolError, Result};

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 13;

/// Maximum payload size accepted on the wire (10 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum total frame size
pub const MAX_FRAME_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_SIZE;

/// Kind of a framed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// UTF-8 chat text
    Text,
    /// Identity exchange binding a session to a peer id
    Handshake,
    /// List of known peer addresses
    PeerList,
    /// Liveness probe
    Ping,
    /// Reply to a ping
    Pong,
    /// Any other type byte, kept so callers can decide to drop it.
    ///
    /// Messages normalize this, so `Unrecognized(3)` becomes [`Ping`](Self::Ping).
    Unrecognized(u8),
}

impl MessageType {
    /// Wire code of this type
    pub fn code(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Handshake => 1,
            Self::PeerList => 2,
            Self::Ping => 3,
            Self::Pong => 4,
            Self::Unrecognized(code) => code,
        }
    }

    /// Human-readable name for logging
    pub fn name(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Handshake => "Handshake",
            Self::PeerList => "PeerList",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Unrecognized(_) => "Unrecognized",
        }
    }

    /// Canonical variant for this type's wire code
    pub fn normalized(self) -> Self {
        Self::from(self.code())
    }
}

impl From<u8> for MessageType {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Text,
            1 => Self::Handshake,
            2 => Self::PeerList,
            3 => Self::Ping,
            4 => Self::Pong,
            other => Self::Unrecognized(other),
        }
    }
}

/// A single framed message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    message_type: MessageType,
    payload: Vec<u8>,
    timestamp: i64,
}

impl Message {
    /// Create a message stamped with the current time
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::PayloadSizeMismatch` if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`]
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        Self::with_timestamp(message_type, payload, chrono::Utc::now().timestamp_millis())
    }

    /// Create a message with an explicit timestamp in milliseconds
    pub fn with_timestamp(message_type: MessageType, payload: Vec<u8>, timestamp: i64) -> Result<Self> {
        check_payload_len(payload.len())?;
        Ok(Self {
            message_type: message_type.normalized(),
            payload,
            timestamp,
        })
    }

    /// Create a text message
    pub fn text(text: &str) -> Result<Self> {
        Self::new(MessageType::Text, text.as_bytes().to_vec())
    }

    /// Create a handshake carrying a peer id and public key
    pub fn handshake(peer_id: &str, public_key: &[u8]) -> Result<Self> {
        let payload = HandshakePayload {
            peer_id: peer_id.to_string(),
            public_key: public_key.to_vec(),
        }
        .to_bytes()?;
        Self::new(MessageType::Handshake, payload)
    }

    /// Create a peer list message from `address:port` strings
    pub fn peer_list<S: AsRef<str>>(peers: &[S]) -> Result<Self> {
        Self::new(MessageType::PeerList, encode_peer_list(peers)?)
    }

    /// Create a ping
    pub fn ping() -> Self {
        Self::empty(MessageType::Ping)
    }

    /// Create a pong
    pub fn pong() -> Self {
        Self::empty(MessageType::Pong)
    }

    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type: message_type.normalized(),
            payload: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Total encoded length
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode the message into a single frame
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.header().to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode a message from a buffer holding at least one full frame.
    ///
    /// Trailing bytes after the declared payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::FrameTooShort {
                len: bytes.len(),
                header: HEADER_LEN,
            }
            .into());
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = FrameHeader::parse(&raw)?;

        let available = bytes.len() - HEADER_LEN;
        if header.payload_len > available {
            return Err(ProtocolError::PayloadSizeMismatch {
                declared: header.payload_len,
                reason: format!("only {available} bytes available"),
            }
            .into());
        }

        let payload = bytes[HEADER_LEN..HEADER_LEN + header.payload_len].to_vec();
        Ok(header.into_message(payload))
    }

    /// Header describing this message
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            message_type: self.message_type,
            payload_len: self.payload.len(),
            timestamp: self.timestamp,
        }
    }
}

/// Parsed and validated frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message type
    pub message_type: MessageType,
    /// Declared payload length, already checked against the cap
    pub payload_len: usize,
    /// Timestamp in milliseconds
    pub timestamp: i64,
}

impl FrameHeader {
    /// Parse a raw header, rejecting lengths above [`MAX_PAYLOAD_SIZE`]
    /// before anything is allocated for the payload.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let message_type = MessageType::from(raw[0]);
        let payload_len = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        check_payload_len(payload_len)?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[5..HEADER_LEN]);

        Ok(Self {
            message_type,
            payload_len,
            timestamp: i64::from_be_bytes(ts),
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = self.message_type.code();
        // payload_len never exceeds MAX_PAYLOAD_SIZE, which fits in a u32
        raw[1..5].copy_from_slice(&(self.payload_len as u32).to_be_bytes());
        raw[5..].copy_from_slice(&self.timestamp.to_be_bytes());
        raw
    }

    /// Combine the header with its payload
    pub fn into_message(self, payload: Vec<u8>) -> Message {
        debug_assert_eq!(payload.len(), self.payload_len);
        Message {
            message_type: self.message_type.normalized(),
            payload,
            timestamp: self.timestamp,
        }
    }
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadSizeMismatch {
            declared: len,
            reason: format!("exceeds the {MAX_PAYLOAD_SIZE} byte limit"),
        }
        .into());
    }
    Ok(())
}

/// Contents of a handshake frame: `[id len u16 BE][id][public key]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Sender's peer id
    pub peer_id: String,
    /// Sender's public key
    pub public_key: Vec<u8>,
}

impl HandshakePayload {
    /// Parse a handshake payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = |reason: &str| ProtocolError::MalformedHandshake {
            reason: reason.to_string(),
        };

        if payload.len() < 2 {
            return Err(malformed("missing id length").into());
        }
        let id_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let rest = &payload[2..];
        if id_len > rest.len() {
            return Err(ProtocolError::MalformedHandshake {
                reason: format!("id length {id_len} exceeds remaining {} bytes", rest.len()),
            }
            .into());
        }
        if id_len == 0 {
            return Err(malformed("empty peer id").into());
        }

        let peer_id = std::str::from_utf8(&rest[..id_len])
            .map_err(|_| malformed("peer id is not valid UTF-8"))?
            .to_string();

        Ok(Self {
            peer_id,
            public_key: rest[id_len..].to_vec(),
        })
    }

    /// Serialize the payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let id = self.peer_id.as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| ProtocolError::MalformedHandshake {
            reason: format!("peer id of {} bytes does not fit a u16 length", id.len()),
        })?;

        let mut payload = Vec::with_capacity(2 + id.len() + self.public_key.len());
        payload.extend_from_slice(&id_len.to_be_bytes());
        payload.extend_from_slice(id);
        payload.extend_from_slice(&self.public_key);
        Ok(payload)
    }
}

/// Encode `address:port` strings as `[count u16 BE]` + `[len u16 BE][utf8]...`
pub fn encode_peer_list<S: AsRef<str>>(peers: &[S]) -> Result<Vec<u8>> {
    let count = u16::try_from(peers.len()).map_err(|_| ProtocolError::MalformedPeerList {
        reason: format!("{} peers do not fit a u16 count", peers.len()),
    })?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&count.to_be_bytes());
    for peer in peers {
        let bytes = peer.as_ref().as_bytes();
        let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::MalformedPeerList {
            reason: "peer entry longer than 65535 bytes".to_string(),
        })?;
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(bytes);
    }
    Ok(payload)
}

/// Parse a peer list payload into `address:port` strings
pub fn parse_peer_list(payload: &[u8]) -> Result<Vec<String>> {
    let malformed = |reason: String| ProtocolError::MalformedPeerList { reason };

    if payload.len() < 2 {
        return Err(malformed("missing peer count".to_string()).into());
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;
    // Each entry needs at least its 2-byte length, so cap the reservation by what is present.
    let mut peers = Vec::with_capacity(count.min((payload.len() - offset) / 2));

    for index in 0..count {
        if payload.len() < offset + 2 {
            return Err(malformed(format!("entry {index} is missing its length")).into());
        }
        let len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if payload.len() < offset + len {
            return Err(malformed(format!("entry {index} declares {len} bytes past the end")).into());
        }
        let entry = std::str::from_utf8(&payload[offset..offset + len])
            .map_err(|_| malformed(format!("entry {index} is not valid UTF-8")))?;
        peers.push(entry.to_string());
        offset += len;
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::NodeError;

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = Message::with_timestamp(MessageType::Text, b"hello".to_vec(), 1_700_000_000_123).unwrap();
        let bytes = message.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(Message::decode(&bytes).unwrap(), message);

        let empty = Message::with_timestamp(MessageType::Pong, Vec::new(), -42).unwrap();
        assert_eq!(Message::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_header_layout() {
        let message = Message::with_timestamp(MessageType::Ping, vec![0xAA; 3], 0x0102_0304_0506_0708).unwrap();
        let bytes = message.encode();
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 3]);
        assert_eq!(&bytes[5..13], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[13..], &[0xAA; 3]);
    }

    #[test]
    fn test_short_frame() {
        let bytes = Message::text("hi").unwrap().encode();
        for len in 0..HEADER_LEN {
            match Message::decode(&bytes[..len]) {
                Err(NodeError::Protocol(ProtocolError::FrameTooShort { len: got, .. })) => assert_eq!(got, len),
                other => panic!("expected FrameTooShort, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = Message::text("hello world").unwrap().encode();
        let result = Message::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            result,
            Err(NodeError::Protocol(ProtocolError::PayloadSizeMismatch { declared: 11, .. }))
        ));
    }

    #[test]
    fn test_oversized_declared_length_rejected_from_header() {
        let mut raw = [0u8; HEADER_LEN];
        raw[1..5].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            FrameHeader::parse(&raw),
            Err(NodeError::Protocol(ProtocolError::PayloadSizeMismatch { .. }))
        ));
        // Only the header is supplied; decode must fail on the cap, not try to read.
        assert!(Message::decode(&raw).is_err());

        let just_over = (MAX_PAYLOAD_SIZE + 1) as u32;
        raw[1..5].copy_from_slice(&just_over.to_be_bytes());
        assert!(FrameHeader::parse(&raw).is_err());
    }

    #[test]
    fn test_oversized_construction_rejected() {
        let result = Message::new(MessageType::Text, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            result,
            Err(NodeError::Protocol(ProtocolError::PayloadSizeMismatch { .. }))
        ));
        assert!(Message::new(MessageType::Text, vec![0u8; MAX_PAYLOAD_SIZE]).is_ok());
    }

    #[test]
    fn test_unrecognized_type_decodes() {
        let mut bytes = Message::text("x").unwrap().encode();
        bytes[0] = 5;
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Unrecognized(5));
        assert_eq!(decoded.encode(), bytes);

        bytes[0] = 200;
        assert_eq!(Message::decode(&bytes).unwrap().message_type(), MessageType::Unrecognized(200));
    }

    #[test]
    fn test_unrecognized_known_code_is_normalized() {
        let message = Message::new(MessageType::Unrecognized(3), Vec::new()).unwrap();
        assert_eq!(message.message_type(), MessageType::Ping);
        assert_eq!(Message::decode(&message.encode()).unwrap(), message);

        let message = Message::new(MessageType::Unrecognized(9), vec![1]).unwrap();
        assert_eq!(message.message_type(), MessageType::Unrecognized(9));
        assert_eq!(Message::decode(&message.encode()).unwrap(), message);
        assert_eq!(MessageType::Unrecognized(0).normalized(), MessageType::Text);
    }

    #[test]
    fn test_handshake_payload() {
        let message = Message::handshake("a1b2c3d4e5f60718", &[9, 8, 7]).unwrap();
        assert_eq!(message.message_type(), MessageType::Handshake);
        assert_eq!(&message.payload()[..2], &[0, 16]);

        let parsed = HandshakePayload::parse(message.payload()).unwrap();
        assert_eq!(parsed.peer_id, "a1b2c3d4e5f60718");
        assert_eq!(parsed.public_key, vec![9, 8, 7]);
    }

    #[test]
    fn test_malformed_handshake() {
        // id length 10 with only 3 bytes following
        let payload = [0u8, 10, b'a', b'b', b'c'];
        assert!(matches!(
            HandshakePayload::parse(&payload),
            Err(NodeError::Protocol(ProtocolError::MalformedHandshake { .. }))
        ));
        assert!(HandshakePayload::parse(&[0]).is_err());
        assert!(HandshakePayload::parse(&[0, 0, 1, 2]).is_err());
        assert!(HandshakePayload::parse(&[0, 2, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_peer_list() {
        let peers = vec!["10.0.0.1:8080".to_string(), "example.org:9000".to_string()];
        let message = Message::peer_list(&peers).unwrap();
        assert_eq!(&message.payload()[..2], &[0, 2]);
        assert_eq!(parse_peer_list(message.payload()).unwrap(), peers);

        let empty: [&str; 0] = [];
        assert!(parse_peer_list(&encode_peer_list(&empty).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_peer_list() {
        assert!(parse_peer_list(&[]).is_err());
        // claims two entries, carries one
        let mut payload = encode_peer_list(&["a:1"]).unwrap();
        payload[1] = 2;
        assert!(matches!(
            parse_peer_list(&payload),
            Err(NodeError::Protocol(ProtocolError::MalformedPeerList { .. }))
        ));
        // huge count on a tiny buffer must not over-allocate
        assert!(parse_peer_list(&[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_as_text() {
        assert_eq!(Message::text("hi").unwrap().as_text(), Some("hi"));
        let binary = Message::new(MessageType::Text, vec![0xFF, 0xFE]).unwrap();
        assert_eq!(binary.as_text(), None);
    }
}
