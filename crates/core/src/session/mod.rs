//! One application session: the camera, every detector loop, aggregation,
//! the vision-language loop, the backend socket and scene changes.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::watch, time::MissedTickBehavior};

use crate::{
    aggregate::{VisionAggregator, VisionData},
    camera::{
        CameraManager, CaptureConstraints, CaptureDevice, CaptureSession, CaptureStatus, VideoSink,
    },
    config::{AppConfig, SchedulerConfig},
    detector::DetectorRegistry,
    inference::{InferenceLoop, VisionLanguageModel},
    preset::{self, HudConfig, HudOverrides},
    scene::SceneCatalog,
    scheduler::{DetectionScheduler, SchedulerTiming},
    state::ModuleStore,
    store::AppStore,
    task::{CancelGate, LoopHandle},
    transition::{TransitionCallbacks, TransitionMachine},
    transport::{Connector, TransportClient, TransportSources},
    Modality, Result,
};

/// Host-supplied collaborators for a session.
pub struct SessionParts {
    pub device: Arc<dyn CaptureDevice>,
    pub detectors: DetectorRegistry,
    pub vision_model: Option<Arc<dyn VisionLanguageModel>>,
    pub connector: Option<Arc<dyn Connector>>,
    pub catalog: SceneCatalog,
}

/// Running schedulers plus the HUD config that decides which ones run.
struct DetectionPlane {
    registry: DetectorRegistry,
    sink: Arc<VideoSink>,
    store: Arc<ModuleStore>,
    timing: SchedulerConfig,
    hud: watch::Sender<HudConfig>,
    running: tokio::sync::Mutex<BTreeMap<Modality, DetectionScheduler>>,
}

impl DetectionPlane {
    /// Cancels schedulers of modalities `hud` disables and spawns schedulers
    /// for the ones it enables. Detector handles are untouched.
    async fn apply(&self, hud: HudConfig) {
        let mut running = self.running.lock().await;
        self.hud.send_replace(hud);

        for modality in Modality::ALL {
            let wanted = hud.modalities.is_enabled(modality);
            match (wanted, running.contains_key(&modality)) {
                (true, false) => {
                    let Some(adapter) = self.registry.get(modality) else {
                        tracing::debug!(%modality, "enabled but no detector registered");
                        continue;
                    };
                    let timing = SchedulerTiming::for_modality(&self.timing, modality);
                    let scheduler = DetectionScheduler::spawn(
                        adapter,
                        self.sink.clone(),
                        self.store.clone(),
                        timing,
                    );
                    running.insert(modality, scheduler);
                }
                (false, true) => {
                    if let Some(scheduler) = running.remove(&modality) {
                        scheduler.shutdown().await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn stop_all(&self) {
        let mut running = self.running.lock().await;
        for (_, scheduler) in std::mem::take(&mut *running) {
            scheduler.shutdown().await;
        }
    }
}

/// Wires every subsystem together for one session.
pub struct PerceptionSession {
    config: AppConfig,
    camera: CameraManager,
    plane: Arc<DetectionPlane>,
    app: Arc<AppStore>,
    catalog: Arc<SceneCatalog>,
    transitions: TransitionMachine,
    vision: Arc<watch::Sender<Arc<VisionData>>>,
    inference: Option<InferenceLoop>,
    transport: Option<TransportClient>,
    background: Mutex<Vec<LoopHandle>>,
}

impl PerceptionSession {
    pub fn new(config: AppConfig, parts: SessionParts) -> Self {
        let camera = CameraManager::new(parts.device);
        let sink = camera.sink();
        let store = Arc::new(ModuleStore::new());
        let app = Arc::new(AppStore::new(config.session.engagement_freshness()));

        let initial = preset::resolve(&config.session.initial_preset, &HudOverrides::default());
        let (hud, _) = watch::channel(initial);
        let (vision, _) = watch::channel(Arc::new(VisionData::default()));

        let inference = match parts.vision_model {
            Some(model) if config.inference.enabled => {
                Some(InferenceLoop::new(model, sink.clone(), &config.inference, store.epoch()))
            }
            _ => None,
        };
        let transport = match parts.connector {
            Some(connector) if config.transport.enabled => {
                let sources = TransportSources {
                    sink: sink.clone(),
                    analysis: inference.as_ref().map(InferenceLoop::subscribe_analysis),
                    store: app.clone(),
                };
                Some(TransportClient::new(connector, config.transport.clone(), sources))
            }
            _ => None,
        };

        Self {
            plane: Arc::new(DetectionPlane {
                registry: parts.detectors,
                sink,
                store,
                timing: config.scheduler.clone(),
                hud,
                running: tokio::sync::Mutex::new(BTreeMap::new()),
            }),
            config,
            camera,
            app,
            catalog: Arc::new(parts.catalog),
            transitions: TransitionMachine::new(),
            vision: Arc::new(vision),
            inference,
            transport,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Acquires the camera, then applies the initial preset and starts every
    /// background loop. Capture errors are returned and nothing is started.
    pub async fn start(&self) -> Result<CaptureSession> {
        let session = self
            .camera
            .acquire(CaptureConstraints::from(&self.config.camera))
            .await?;

        let initial = *self.plane.hud.borrow();
        self.plane.apply(initial).await;

        {
            let mut background = self.background.lock();
            if background.is_empty() {
                background.push(self.spawn_aggregator());
                background.push(self.spawn_scene_follower());
            }
        }
        if let Some(inference) = &self.inference {
            inference.start();
        }
        if let Some(transport) = &self.transport {
            transport.start();
        }

        tracing::info!(preset = %self.config.session.initial_preset, "perception session started");
        Ok(session)
    }

    /// Switches the running detector set to `hud`.
    pub async fn apply_config(&self, hud: HudConfig) {
        self.plane.apply(hud).await;
    }

    /// Starts a transition to scene `to`. The displayed scene index changes at
    /// the transition's swap moment and the scene's config follows it.
    pub fn request_scene(&self, to: usize) -> bool {
        if self.catalog.get(to).is_none() {
            tracing::warn!(scene = to, "no such scene");
            return false;
        }
        let from = self.app.scene_index();
        let app = self.app.clone();
        self.transitions.request(
            from,
            to,
            TransitionCallbacks::new(
                move || {
                    app.set_scene(to);
                },
                move || tracing::debug!(from, to, "scene settled"),
            ),
        )
    }

    /// Moves on to the next scene in the catalog.
    pub fn advance(&self) -> bool {
        self.request_scene(self.catalog.next_index(self.app.scene_index()))
    }

    /// Stops every loop, releases the camera and disposes every detector.
    pub async fn shutdown(&self) {
        let background = std::mem::take(&mut *self.background.lock());
        for handle in background {
            handle.shutdown().await;
        }
        if let Some(inference) = &self.inference {
            inference.shutdown().await;
        }
        if let Some(transport) = &self.transport {
            transport.shutdown().await;
        }
        self.plane.stop_all().await;
        self.camera.release().await;
        self.plane.registry.dispose_all().await;
        tracing::info!("perception session stopped");
    }

    pub fn hud_config(&self) -> HudConfig {
        *self.plane.hud.borrow()
    }

    pub async fn running_modalities(&self) -> Vec<Modality> {
        self.plane.running.lock().await.keys().copied().collect()
    }

    pub fn vision(&self) -> watch::Receiver<Arc<VisionData>> {
        self.vision.subscribe()
    }

    pub fn latest_vision(&self) -> Arc<VisionData> {
        self.vision.borrow().clone()
    }

    pub fn module_store(&self) -> &Arc<ModuleStore> {
        &self.plane.store
    }

    pub fn app_store(&self) -> &Arc<AppStore> {
        &self.app
    }

    pub fn catalog(&self) -> &SceneCatalog {
        &self.catalog
    }

    pub fn camera(&self) -> &CameraManager {
        &self.camera
    }

    /// Capture track state for the UI; a failed track stays reported until
    /// the camera is acquired again.
    pub fn camera_status(&self) -> watch::Receiver<CaptureStatus> {
        self.camera.subscribe_status()
    }

    pub fn transitions(&self) -> &TransitionMachine {
        &self.transitions
    }

    pub fn inference(&self) -> Option<&InferenceLoop> {
        self.inference.as_ref()
    }

    pub fn transport(&self) -> Option<&TransportClient> {
        self.transport.as_ref()
    }

    fn spawn_aggregator(&self) -> LoopHandle {
        let gate = Arc::new(CancelGate::new());
        let token = gate.token().clone();
        let plane = self.plane.clone();
        let vision = self.vision.clone();
        let period = self.config.session.aggregation_interval();
        let publish = gate.clone();

        let task = tokio::spawn(async move {
            let mut aggregator = VisionAggregator::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let hud = *plane.hud.borrow();
                let data = aggregator.compose(&plane.store, &hud, plane.store.now_ms());
                publish.publish(|| vision.send_replace(Arc::new(data)));
            }
        });
        LoopHandle::new(gate, task)
    }

    fn spawn_scene_follower(&self) -> LoopHandle {
        let gate = Arc::new(CancelGate::new());
        let token = gate.token().clone();
        let plane = self.plane.clone();
        let catalog = self.catalog.clone();
        let mut scene = self.app.subscribe_scene();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = scene.changed() => if changed.is_err() { break },
                }
                let index = *scene.borrow_and_update();
                match catalog.get(index) {
                    Some(descriptor) => {
                        tracing::info!(
                            scene = index,
                            name = %descriptor.name,
                            preset = %descriptor.preset,
                            "applying scene config"
                        );
                        plane.apply(descriptor.effective_config()).await;
                    }
                    None => tracing::warn!(scene = index, "scene index outside the catalog"),
                }
            }
        });
        LoopHandle::new(gate, task)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        camera::testing::FakeDevice, detector::testing::ScriptedLoader, detector::DetectorAdapter,
        transition::PORTAL_DURATION, KioskError,
    };

    fn registry() -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        for modality in Modality::ALL {
            registry.register(DetectorAdapter::new(
                modality,
                ScriptedLoader::new(modality, Duration::from_millis(20)),
            ));
        }
        registry
    }

    fn session(device: Arc<FakeDevice>) -> PerceptionSession {
        let mut config = AppConfig::default();
        config.inference.enabled = false;
        config.transport.enabled = false;
        PerceptionSession::new(
            config,
            SessionParts {
                device,
                detectors: registry(),
                vision_model: None,
                connector: None,
                catalog: SceneCatalog::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_the_initial_preset() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(16)));
        let session = session(device.clone());
        session.start().await.unwrap();

        assert_eq!(
            session.running_modalities().await,
            vec![Modality::Face, Modality::Pose, Modality::Hands]
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        let vision = session.latest_vision();
        assert!(vision.face_landmarks().is_some());
        assert!(vision.detected_objects().is_none());

        session.shutdown().await;
        assert!(!session.camera().is_streaming().await);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denial_reaches_the_caller() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(16)));
        device.deny.store(true, std::sync::atomic::Ordering::SeqCst);
        let session = session(device);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, KioskError::PermissionDenied));
        assert!(session.running_modalities().await.is_empty());
        assert!(matches!(*session.camera_status().borrow(), CaptureStatus::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_camera_is_reported_and_restart_reopens_it() {
        let device = Arc::new(FakeDevice::new(Duration::from_millis(16)));
        *device.fail_at.lock() = Some(5);
        let session = session(device.clone());
        let mut status = session.camera_status();
        session.start().await.unwrap();

        status
            .wait_for(|current| matches!(current, CaptureStatus::Failed { .. }))
            .await
            .unwrap();
        assert!(!session.camera().is_streaming().await);

        *device.fail_at.lock() = None;
        session.start().await.unwrap();
        assert_eq!(device.opens.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(session.camera().status(), CaptureStatus::Streaming);
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_apply_config_keeps_hud_and_schedulers_in_step() {
        let session = Arc::new(session(Arc::new(FakeDevice::new(Duration::from_millis(16)))));
        session.start().await.unwrap();
        let presets = ["object-scan", "full-analysis", "body-tracking", "face-focus"];

        for round in 0..20 {
            let calls: Vec<_> = presets
                .iter()
                .map(|name| {
                    let session = session.clone();
                    let hud = preset::resolve(name, &HudOverrides::default());
                    tokio::spawn(async move { session.apply_config(hud).await })
                })
                .collect();
            for call in calls {
                call.await.unwrap();
            }

            let hud = session.hud_config();
            let expected: Vec<Modality> = Modality::ALL
                .into_iter()
                .filter(|modality| hud.modalities.is_enabled(*modality))
                .collect();
            assert_eq!(session.running_modalities().await, expected, "round {round}");
        }
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn apply_config_diffs_running_schedulers() {
        let session = session(Arc::new(FakeDevice::new(Duration::from_millis(16))));
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        session
            .apply_config(preset::resolve("object-scan", &HudOverrides::default()))
            .await;
        assert_eq!(session.running_modalities().await, vec![Modality::Objects]);
        assert!(!session.module_store().state(Modality::Face).enabled);

        // cached face result stays in the store but never reaches the snapshot
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(session.module_store().latest(Modality::Face).is_some());
        assert!(session.latest_vision().face.is_none());

        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scene_changes_at_the_swap_and_applies_its_preset() {
        let session = session(Arc::new(FakeDevice::new(Duration::from_millis(16))));
        session.start().await.unwrap();

        assert!(session.request_scene(1));
        assert!(!session.request_scene(2));
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(session.app_store().scene_index(), 0);

        tokio::time::sleep(PORTAL_DURATION).await;
        assert_eq!(session.app_store().scene_index(), 1);

        assert!(session.request_scene(3));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(session.app_store().scene_index(), 3);
        assert_eq!(session.running_modalities().await, vec![Modality::Pose]);
        assert!(!session.request_scene(99));

        session.shutdown().await;
    }
}
