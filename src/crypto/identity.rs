//! Identity provider and Ed25519 key handling.
//!
//! The session layer only needs two things from an identity: a public key to
//! announce in the handshake and a stable peer id derived from it. Those are
//! reached through the [`IdentityProvider`] trait so a different key scheme
//! can be plugged in without touching networking code.

use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of SHA-256 bytes kept in a peer id
pub const PEER_ID_BYTES: usize = 8;

/// Raw key material produced by an [`IdentityProvider`]
#[derive(Clone)]
pub struct KeyPair {
    /// Public key bytes, shared in handshakes
    pub public_key: Vec<u8>,
    /// Private key bytes, never leave the node
    pub private_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Key generation, peer id derivation and signing capability
pub trait IdentityProvider: Send + Sync {
    /// Generate a fresh key pair
    fn generate_key_pair(&self) -> KeyPair;

    /// Derive the peer id for a public key.
    ///
    /// Must be deterministic: the same key always yields the same id.
    fn derive_peer_id(&self, public_key: &[u8]) -> String;

    /// Sign `data` with a private key
    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature over `data`
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<()>;

    /// Derive a 32-byte shared secret between our private key and a peer's public key
    fn derive_shared_secret(&self, private_key: &[u8], public_key: &[u8]) -> Result<[u8; 32]>;
}

/// Ed25519 identities with SHA-256 peer ids and X25519 key agreement
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519IdentityProvider;

impl Ed25519IdentityProvider {
    /// Create the provider
    pub fn new() -> Self {
        Self
    }

    fn signing_key(private_key: &[u8]) -> Result<SigningKey> {
        let bytes: [u8; SECRET_KEY_LENGTH] =
            private_key.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid secret key length: expected {}, got {}",
                    SECRET_KEY_LENGTH,
                    private_key.len()
                ),
            })?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    fn verifying_key(public_key: &[u8]) -> Result<VerifyingKey> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            public_key.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid public key length: expected {}, got {}",
                    PUBLIC_KEY_LENGTH,
                    public_key.len()
                ),
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| {
            CryptoError::InvalidKey {
                reason: "Public key is not a valid curve point".to_string(),
            }
            .into()
        })
    }
}

impl IdentityProvider for Ed25519IdentityProvider {
    fn generate_key_pair(&self) -> KeyPair {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair {
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: signing_key.to_bytes().to_vec(),
        }
    }

    fn derive_peer_id(&self, public_key: &[u8]) -> String {
        let digest = Sha256::digest(public_key);
        hex::encode(&digest[..PEER_ID_BYTES])
    }

    fn sign(&self, private_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = Self::signing_key(private_key)?;
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::SignatureVerification.into());
        }

        let verifying_key = Self::verifying_key(public_key)?;
        let sig = Signature::from_bytes(
            signature
                .try_into()
                .map_err(|_| CryptoError::SignatureVerification)?,
        );

        verifying_key
            .verify(data, &sig)
            .map_err(|_| CryptoError::SignatureVerification.into())
    }

    fn derive_shared_secret(&self, private_key: &[u8], public_key: &[u8]) -> Result<[u8; 32]> {
        let signing_key = Self::signing_key(private_key)?;
        let verifying_key = Self::verifying_key(public_key)?;

        // Map both Edwards keys onto Curve25519 and run X25519.
        let secret = x25519_dalek::StaticSecret::from(signing_key.to_scalar_bytes());
        let their_public = x25519_dalek::PublicKey::from(verifying_key.to_montgomery().to_bytes());
        let shared = secret.diffie_hellman(&their_public);

        if !shared.was_contributory() {
            return Err(CryptoError::KeyDerivation {
                reason: "Peer public key produced a low-order shared secret".to_string(),
            }
            .into());
        }

        Ok(shared.to_bytes())
    }
}
