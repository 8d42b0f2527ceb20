//! Transport layer for peer messaging.
//!
//! This module provides the binary wire format and the helpers that move
//! whole frames over async byte streams.

pub mod framed;
pub mod protocol;

pub use framed::{read_frame, write_frame};
pub use protocol::*;
