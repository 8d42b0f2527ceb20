//! Utility modules for configuration, error handling and shutdown signalling.

pub mod config;
#[deny(missing_docs)]
pub mod errors;
pub mod shutdown;

pub use config::*;
pub use errors::*;
pub use shutdown::{Shutdown, ShutdownSignal};
