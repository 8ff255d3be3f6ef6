use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative stop flag shared by the signal handler and the agent loop.
///
/// Requesting a stop never interrupts an in-flight exchange call; the loop
/// checks the flag between steps and wakes from its sleep immediately.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in self, so this only errors if it was dropped elsewhere
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
