use std::future::Future;

use tokio::sync::watch;
use tracing::info;

/// Create a paired shutdown handle and signal. The handle side triggers,
/// every cloned signal observes the trigger. Dropping the handle counts as
/// a trigger so orphaned tasks still unwind.
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested (or the handle is gone).
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

/// Drive `task` to completion unless ctrl-c arrives first. Returns `None`
/// when interrupted; the caller triggers its own shutdown handles.
pub async fn run_with_ctrl_c<F: Future>(task: F) -> Option<F::Output> {
    tokio::select! {
        output = task => Some(output),
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            None
        }
    }
}
