use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    Denied,
    #[error("no capture device available")]
    NoDevice,
}

/// Local capture acquisition. Denial is final and reported to the user;
/// a voice session never proceeds silently muted.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaHandle, MediaError>;
}

/// Opaque handle over acquired local tracks. Dropping it releases them, so
/// cleanup is never gated on a network call.
#[derive(Debug)]
pub struct MediaHandle {
    label: String,
    released: Arc<AtomicBool>,
}

impl MediaHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn release(self) {
        // Drop does the work.
    }

    fn release_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        debug!(label = %self.label, "local media released");
    }
}

/// Deterministic media source for tests and the loopback demo.
#[derive(Debug, Default)]
pub struct StaticMedia {
    deny: bool,
    last_flag: std::sync::Mutex<Option<Arc<AtomicBool>>>,
}

impl StaticMedia {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            last_flag: std::sync::Mutex::new(None),
        }
    }

    /// Whether the most recently acquired handle has been released.
    pub fn last_released(&self) -> Option<bool> {
        self.last_flag
            .lock()
            .expect("media flag lock")
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaSource for StaticMedia {
    async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        if self.deny {
            return Err(MediaError::Denied);
        }
        let handle = MediaHandle::new("static-capture");
        *self.last_flag.lock().expect("media flag lock") = Some(handle.release_flag());
        Ok(handle)
    }
}
