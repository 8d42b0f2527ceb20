//! Session layer.
//!
//! A [`Session`] is one TCP connection moving through the handshake state
//! machine; the [`SessionManager`] owns all of them, binds them to peer ids
//! and dispatches received messages to the application.

pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::{ConnectionHandler, MessageHandler, SessionManager};
pub use session::{Session, SessionEvents, SessionId, SessionRole, SessionState, SessionStats};
