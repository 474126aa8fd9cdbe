use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Owned by the server loop; completes [`ShutdownCoordinator::wait`] once any
/// handle asks for shutdown.
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

/// Cheap clonable trigger.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn shutdown(&self, reason: &str) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested: {}", reason);
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}
