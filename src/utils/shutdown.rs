//! Cooperative shutdown signalling.
//!
//! A [`Shutdown`] is the trigger side; any number of [`ShutdownSignal`]s can
//! be handed to spawned tasks, which race their I/O against
//! [`ShutdownSignal::wait`]. Triggering is idempotent. Dropping every clone of
//! a `Shutdown` resolves all of its signals as well, so a task can never
//! outlive the owner that was supposed to stop it.

use std::sync::Arc;
use tokio::sync::watch;

/// Trigger for shutdowns.
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Resolve every signal created from this shutdown
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether `trigger` has been called
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Create a signal that resolves when this shutdown triggers
    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver end of a shutdown. Once resolved the holder should stop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether the shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown to trigger.
    ///
    /// Also resolves when the `Shutdown` has been dropped.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }
}
