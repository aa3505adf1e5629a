use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};

use crate::{
    config::CameraConfig,
    task::{CancelGate, LoopHandle},
    Result,
};

/// Which physical camera the constraints ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera, facing the person at the kiosk.
    User,
    Environment,
}

/// Preferred capture settings handed to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
    pub frame_rate: u32,
}

impl From<&CameraConfig> for CaptureConstraints {
    fn from(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            facing: config.facing,
            frame_rate: config.frame_rate,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::from(&CameraConfig::default())
    }
}

/// One captured video frame, JPEG encoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
}

impl Frame {
    /// A frame with no payload is one the device announced but could not
    /// decode yet.
    pub fn is_decodable(&self) -> bool {
        !self.jpeg.is_empty() && self.width > 0 && self.height > 0
    }
}

/// Platform capture backend.
pub trait CaptureDevice: Send + Sync {
    /// Opens the device. Fails with [`crate::KioskError::PermissionDenied`] or
    /// [`crate::KioskError::DeviceUnavailable`].
    fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> BoxFuture<'_, Result<Box<dyn CaptureStream>>>;
}

/// Live track produced by [`CaptureDevice::open`].
pub trait CaptureStream: Send {
    /// Waits for the next frame. `Ok(None)` means the track ended.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Frame>>>;

    /// Stops every track of the stream.
    fn stop(&mut self);
}

/// The single shared video element every detector reads from.
#[derive(Debug)]
pub struct VideoSink {
    latest: watch::Sender<Option<Arc<Frame>>>,
}

impl Default for VideoSink {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSink {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self { latest }
    }

    /// Most recent frame, if the stream has produced one.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.latest.borrow().clone()
    }

    /// Most recent frame only when it can be decoded.
    pub fn decodable_frame(&self) -> Option<Arc<Frame>> {
        self.current_frame().filter(|frame| frame.is_decodable())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.latest.subscribe()
    }

    pub(crate) fn push(&self, frame: Frame) {
        self.latest.send_replace(Some(Arc::new(frame)));
    }

    pub(crate) fn clear(&self) {
        self.latest.send_replace(None);
    }
}

/// Describes the active capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub constraints: CaptureConstraints,
    pub started_at: Instant,
}

/// Lifecycle of the capture track, as shown to the person at the kiosk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CaptureStatus {
    #[default]
    Stopped,
    Streaming,
    /// The device ended the track.
    Ended,
    /// Opening or reading the device failed.
    Failed { reason: String },
}

#[derive(Debug, Default)]
enum CameraState {
    #[default]
    Stopped,
    Streaming {
        session: CaptureSession,
        pump: LoopHandle,
    },
}

/// Owns the capture device and the shared [`VideoSink`].
pub struct CameraManager {
    device: Arc<dyn CaptureDevice>,
    sink: Arc<VideoSink>,
    status: Arc<watch::Sender<CaptureStatus>>,
    state: tokio::sync::Mutex<CameraState>,
}

impl CameraManager {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            sink: Arc::new(VideoSink::new()),
            status: Arc::new(watch::channel(CaptureStatus::Stopped).0),
            state: tokio::sync::Mutex::new(CameraState::Stopped),
        }
    }

    /// Shared sink handed to every detector consumer.
    pub fn sink(&self) -> Arc<VideoSink> {
        self.sink.clone()
    }

    pub fn status(&self) -> CaptureStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<CaptureStatus> {
        self.status.subscribe()
    }

    /// `false` once the track has ended or failed, even before `release`.
    pub async fn is_streaming(&self) -> bool {
        match &*self.state.lock().await {
            CameraState::Streaming { pump, .. } => !pump.is_finished(),
            CameraState::Stopped => false,
        }
    }

    /// Opens the device and starts pumping frames into the sink.
    ///
    /// Calling this while already streaming returns the running session
    /// without touching the device. A session whose track has ended or
    /// failed is discarded and the device is opened again.
    pub async fn acquire(&self, constraints: CaptureConstraints) -> Result<CaptureSession> {
        let mut state = self.state.lock().await;
        if let CameraState::Streaming { session, pump } = &*state {
            if !pump.is_finished() {
                tracing::debug!("camera already streaming, acquire is a no-op");
                return Ok(session.clone());
            }
        }
        if let CameraState::Streaming { pump, .. } = std::mem::take(&mut *state) {
            pump.shutdown().await;
            tracing::info!("previous capture track is gone, reopening the camera");
        }

        let stream = match self.device.open(&constraints).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "camera acquisition failed");
                self.status.send_replace(CaptureStatus::Failed {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let session = CaptureSession {
            constraints,
            started_at: Instant::now(),
        };
        let gate = Arc::new(CancelGate::new());
        self.status.send_replace(CaptureStatus::Streaming);
        let task = tokio::spawn(pump_frames(
            stream,
            self.sink.clone(),
            self.status.clone(),
            gate.clone(),
        ));
        tracing::info!(
            width = session.constraints.width,
            height = session.constraints.height,
            facing = ?session.constraints.facing,
            "camera streaming"
        );

        *state = CameraState::Streaming {
            session: session.clone(),
            pump: LoopHandle::new(gate, task),
        };
        Ok(session)
    }

    /// Stops the stream and clears the sink. No-op when already stopped.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let CameraState::Streaming { pump, .. } = std::mem::take(&mut *state) {
            pump.shutdown().await;
            self.sink.clear();
            self.status.send_replace(CaptureStatus::Stopped);
            tracing::info!("camera released");
        }
    }
}

impl std::fmt::Debug for CameraManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraManager")
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

/// Feeds the sink until cancelled or until the track stops. A track that
/// stops on its own leaves its last frame in the sink and records why in
/// `status`.
async fn pump_frames(
    mut stream: Box<dyn CaptureStream>,
    sink: Arc<VideoSink>,
    status: Arc<watch::Sender<CaptureStatus>>,
    gate: Arc<CancelGate>,
) {
    let token = gate.token().clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next_frame() => match next {
                Ok(Some(frame)) => {
                    if gate.publish(|| sink.push(frame)).is_none() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("capture track ended");
                    gate.publish(|| status.send_replace(CaptureStatus::Ended));
                    break;
                }
                Err(err) => {
                    tracing::warn!(%err, "capture read failed, keeping last frame");
                    gate.publish(|| {
                        status.send_replace(CaptureStatus::Failed {
                            reason: err.to_string(),
                        })
                    });
                    break;
                }
            },
        }
    }
    stream.stop();
}


#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::{testing::FakeDevice, *};
    use crate::KioskError;

    #[tokio::test(start_paused = true)]
    async fn acquire_is_idempotent_and_feeds_the_sink() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(10)));
        let camera = CameraManager::new(device.clone());

        let first = camera.acquire(CaptureConstraints::default()).await.unwrap();
        let second = camera.acquire(CaptureConstraints::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(35)).await;
        let frame = camera.sink().decodable_frame().expect("frames should arrive");
        assert!(frame.sequence >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn release_stops_tracks_and_clears_sink() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(10)));
        let camera = CameraManager::new(device.clone());
        camera.acquire(CaptureConstraints::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        camera.release().await;
        camera.release().await;

        assert!(!camera.is_streaming().await);
        assert!(camera.sink().current_frame().is_none());
        assert_eq!(device.stops.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(camera.sink().current_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_is_surfaced_and_acquire_reopens() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(10)));
        *device.fail_at.lock() = Some(3);
        let camera = CameraManager::new(device.clone());
        camera.acquire(CaptureConstraints::default()).await.unwrap();
        assert_eq!(camera.status(), CaptureStatus::Streaming);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            camera.status(),
            CaptureStatus::Failed { reason } if reason.contains("usb link lost")
        ));
        assert!(!camera.is_streaming().await);
        // the last good frame stays visible
        assert_eq!(camera.sink().current_frame().map(|f| f.sequence), Some(2));
        assert_eq!(device.stops.load(Ordering::SeqCst), 1);

        *device.fail_at.lock() = None;
        camera.acquire(CaptureConstraints::default()).await.unwrap();
        assert_eq!(device.opens.load(Ordering::SeqCst), 2);
        assert_eq!(camera.status(), CaptureStatus::Streaming);

        // the new track restarts its sequence
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(camera.sink().current_frame().map(|f| f.sequence), Some(1));
        assert!(camera.is_streaming().await);
    }

    #[tokio::test(start_paused = true)]
    async fn track_end_is_reported() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(10)));
        *device.end_at.lock() = Some(2);
        let camera = CameraManager::new(device.clone());
        let mut status = camera.subscribe_status();
        camera.acquire(CaptureConstraints::default()).await.unwrap();

        status.wait_for(|current| *current == CaptureStatus::Ended).await.unwrap();
        assert!(!camera.is_streaming().await);
        assert!(camera.sink().current_frame().is_some());

        camera.release().await;
        assert_eq!(camera.status(), CaptureStatus::Stopped);
        assert!(camera.sink().current_frame().is_none());
    }

    #[tokio::test]
    async fn permission_denial_is_returned() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(10)));
        device.deny.store(true, Ordering::SeqCst);
        let camera = CameraManager::new(device);

        let err = camera.acquire(CaptureConstraints::default()).await.unwrap_err();
        assert!(matches!(err, KioskError::PermissionDenied));
        assert!(!camera.is_streaming().await);
        assert!(matches!(camera.status(), CaptureStatus::Failed { .. }));
    }

    #[test]
    fn empty_frames_are_not_decodable() {
        let mut frame = testing::frame(1);
        assert!(frame.is_decodable());
        frame.jpeg = Bytes::new();
        assert!(!frame.is_decodable());
    }
}
