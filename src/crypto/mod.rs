//! Identity provider seam and the default Ed25519 implementation.

pub mod identity;

pub use identity::*;
