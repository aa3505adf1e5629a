//! Uniform lifecycle around the black-box detection primitives.
//!
//! A [`DetectorAdapter`] builds its primitive lazily and exactly once, even
//! when several schedulers ask for it at the same moment, and keeps it alive
//! across scene changes until [`DetectorAdapter::dispose`] is called.

mod reading;
mod registry;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

pub use reading::{
    BioReading, BoundingBox, DetectedObject, Detection, ExpressionScore, FaceMesh, FaceReading,
    Gesture, Hand, HandReading, Handedness, Landmark, ObjectReading, PoseReading, Sentiment,
    SentimentLabel, SpeechReading,
};
pub use registry::DetectorRegistry;

use crate::{camera::Frame, KioskError, Modality, Result};

/// Constructs the expensive primitive for one modality.
pub trait DetectorLoader: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn DetectionModel>>>;
}

/// A ready detection primitive.
pub trait DetectionModel: Send + Sync {
    /// Runs one detection. `Ok(None)` means nothing was found in this frame.
    fn detect(&self, frame: &Frame, timestamp_ms: u64) -> Result<Option<Detection>>;

    /// Releases native resources. Called once by [`DetectorAdapter::dispose`].
    fn close(&self) {}
}

pub struct DetectorAdapter {
    modality: Modality,
    loader: Box<dyn DetectorLoader>,
    init: tokio::sync::Mutex<()>,
    model: RwLock<Option<Arc<dyn DetectionModel>>>,
    attempts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DetectorAdapter {
    pub fn new(modality: Modality, loader: impl DetectorLoader + 'static) -> Self {
        Self {
            modality,
            loader: Box::new(loader),
            init: tokio::sync::Mutex::new(()),
            model: RwLock::new(None),
            attempts: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn is_ready(&self) -> bool {
        self.model.read().is_some()
    }

    /// Number of construction attempts made so far, successful or not.
    pub fn construction_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the shared primitive, building it on first use.
    ///
    /// Callers that arrive while a construction is running park on the init
    /// lock and observe that construction's outcome instead of starting their
    /// own. A failed attempt can be retried by a later call.
    pub async fn initialize(&self) -> Result<Arc<dyn DetectionModel>> {
        let ready = self.model.read().clone();
        if let Some(model) = ready {
            return Ok(model);
        }

        let seen_attempts = self.attempts.load(Ordering::SeqCst);
        let _guard = self.init.lock().await;

        let ready = self.model.read().clone();
        if let Some(model) = ready {
            return Ok(model);
        }
        if self.attempts.load(Ordering::SeqCst) != seen_attempts {
            // the construction we waited on failed
            let reason = self
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "initialization failed".to_string());
            return Err(self.init_failed(reason));
        }

        tracing::info!(modality = %self.modality, "loading detector");
        let outcome = self.loader.load().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(model) => {
                *self.model.write() = Some(model.clone());
                *self.last_error.lock() = None;
                tracing::info!(modality = %self.modality, "detector ready");
                Ok(model)
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(modality = %self.modality, %reason, "detector failed to load");
                *self.last_error.lock() = Some(reason.clone());
                Err(self.init_failed(reason))
            }
        }
    }

    /// Best-effort detection. Returns `None` when the adapter is not ready,
    /// when the frame cannot be decoded yet, or on transient failure.
    pub fn detect(&self, frame: &Frame, timestamp_ms: u64) -> Option<Detection> {
        let model = self.model.read().clone()?;
        if !frame.is_decodable() {
            return None;
        }

        match model.detect(frame, timestamp_ms) {
            Ok(detection) => detection,
            Err(err) => {
                tracing::debug!(modality = %self.modality, %err, "transient detection failure");
                None
            }
        }
    }

    /// Releases the primitive. The next [`DetectorAdapter::initialize`] builds
    /// a fresh one.
    pub async fn dispose(&self) {
        let _guard = self.init.lock().await;
        let model = self.model.write().take();
        if let Some(model) = model {
            model.close();
            tracing::info!(modality = %self.modality, "detector disposed");
        }
    }

    fn init_failed(&self, reason: String) -> KioskError {
        KioskError::InitializationFailed {
            modality: self.modality,
            reason,
        }
    }
}

impl std::fmt::Debug for DetectorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorAdapter")
            .field("modality", &self.modality)
            .field("ready", &self.is_ready())
            .field("attempts", &self.construction_attempts())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{testing::ScriptedLoader, *};
    use crate::camera::testing::frame;

    #[tokio::test(start_paused = true)]
    async fn concurrent_initialize_constructs_once() {
        let adapter = Arc::new(DetectorAdapter::new(
            Modality::Face,
            ScriptedLoader::new(Modality::Face, Duration::from_millis(200)),
        ));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let adapter = adapter.clone();
                tokio::spawn(async move { adapter.initialize().await })
            })
            .collect();

        let mut models = Vec::new();
        for call in calls {
            models.push(call.await.unwrap().unwrap());
        }

        assert_eq!(adapter.construction_attempts(), 1);
        assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_a_failed_attempt() {
        let loader = ScriptedLoader::new(Modality::Pose, Duration::from_millis(50));
        loader.fail.store(true, Ordering::SeqCst);
        let fail = loader.fail.clone();
        let adapter = Arc::new(DetectorAdapter::new(Modality::Pose, loader));

        let (a, b) = tokio::join!(adapter.initialize(), adapter.initialize());
        assert!(matches!(a, Err(KioskError::InitializationFailed { .. })));
        assert!(matches!(b, Err(KioskError::InitializationFailed { .. })));
        assert_eq!(adapter.construction_attempts(), 1);
        assert!(!adapter.is_ready());

        fail.store(false, Ordering::SeqCst);
        adapter.initialize().await.unwrap();
        assert_eq!(adapter.construction_attempts(), 2);
    }

    #[tokio::test]
    async fn detect_fails_soft() {
        let loader = ScriptedLoader::new(Modality::Hands, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = DetectorAdapter::new(Modality::Hands, loader);

        assert!(adapter.detect(&frame(1), 0).is_none(), "not ready yet");

        adapter.initialize().await.unwrap();
        assert!(adapter.detect(&frame(2), 16).is_some());

        model.fail.store(true, Ordering::SeqCst);
        assert!(adapter.detect(&frame(3), 32).is_none());
        assert!(adapter.is_ready(), "transient failures keep the adapter ready");
    }

    #[tokio::test]
    async fn dispose_resets_the_singleton() {
        let loader = ScriptedLoader::new(Modality::Objects, Duration::ZERO);
        let model = loader.model.clone();
        let adapter = DetectorAdapter::new(Modality::Objects, loader);

        adapter.initialize().await.unwrap();
        adapter.dispose().await;
        assert!(!adapter.is_ready());
        assert!(model.closed.load(Ordering::SeqCst));

        adapter.initialize().await.unwrap();
        assert_eq!(adapter.construction_attempts(), 2);
    }
}
