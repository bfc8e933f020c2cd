//! Local audio capture.
//!
//! The microphone is opened at most once per controller, on the first call
//! that needs it, and then handed to every engine after that. It is only
//! released when the controller shuts down.

use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;

use super::error::CallError;

/// An open capture device.
pub trait AudioCapture: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    /// Stops capturing. Called once, on controller shutdown.
    fn release(&self);
}

/// Opens the capture device.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn AudioCapture>>;
}

/// The controller's lazily opened capture handle.
#[derive(Clone)]
pub(crate) struct SharedAudio {
    source: Arc<dyn AudioSource>,
    capture: Arc<OnceCell<Arc<dyn AudioCapture>>>,
}

impl SharedAudio {
    pub(crate) fn new(source: Arc<dyn AudioSource>) -> Self {
        Self {
            source,
            capture: Arc::new(OnceCell::new()),
        }
    }

    /// Returns the shared capture, opening it on first use.
    pub(crate) async fn acquire(&self) -> Result<Arc<dyn AudioCapture>, CallError> {
        let capture = self
            .capture
            .get_or_try_init(|| async {
                let capture = self
                    .source
                    .acquire()
                    .await
                    .map_err(|e| CallError::Audio(format!("{e:#}")))?;
                info!("Opened audio capture '{}'", capture.label());
                Ok::<_, CallError>(capture)
            })
            .await?;
        Ok(capture.clone())
    }

    pub(crate) fn release(&self) {
        if let Some(capture) = self.capture.get() {
            debug!("Releasing audio capture '{}'", capture.label());
            capture.release();
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// A source producing silence. Counts how often it was opened and closed.
#[derive(Debug, Clone, Default)]
pub struct SilentAudioSource {
    counters: Arc<Counters>,
}

impl SilentAudioSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired_count(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSource for SilentAudioSource {
    async fn acquire(&self) -> anyhow::Result<Arc<dyn AudioCapture>> {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SilentCapture {
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Debug)]
struct SilentCapture {
    counters: Arc<Counters>,
}

impl AudioCapture for SilentCapture {
    fn label(&self) -> &str {
        "silence"
    }

    fn release(&self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoMicrophone;

    #[async_trait]
    impl AudioSource for NoMicrophone {
        async fn acquire(&self) -> anyhow::Result<Arc<dyn AudioCapture>> {
            anyhow::bail!("permission denied")
        }
    }

    #[tokio::test]
    async fn test_capture_is_opened_once() {
        let source = SilentAudioSource::new();
        let shared = SharedAudio::new(Arc::new(source.clone()));

        let first = shared.acquire().await.unwrap();
        let second = shared.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.acquired_count(), 1);
        assert_eq!(source.released_count(), 0);

        shared.release();
        assert_eq!(source.released_count(), 1);
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_a_no_op() {
        let source = SilentAudioSource::new();
        let shared = SharedAudio::new(Arc::new(source.clone()));
        shared.release();
        assert_eq!(source.released_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_failure_maps_to_audio_error() {
        let shared = SharedAudio::new(Arc::new(NoMicrophone));
        let err = shared.acquire().await.unwrap_err();
        assert_eq!(err, CallError::Audio("permission denied".into()));
    }
}
