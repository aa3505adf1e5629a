//! Core library for the kiosk vision application.
//!
//! One physical camera feeds many independently throttled detector loops.
//! Their results are merged into per-tick [`VisionData`] snapshots filtered
//! by the active HUD preset, a vision-language loop describes the newest
//! frame, and a transport streams both to the backend. Scene changes are
//! sequenced by the [`TransitionMachine`]. Each module owns one of these
//! subsystems; [`PerceptionSession`] wires them together.

pub mod aggregate;
pub mod camera;
pub mod config;
pub mod detector;
pub mod error;
pub mod inference;
pub mod keywords;
pub mod modality;
pub mod preset;
pub mod scene;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;
pub mod task;
pub mod transition;
pub mod transport;

pub use aggregate::{VisionAggregator, VisionData};
pub use camera::{
    CameraManager, CaptureConstraints, CaptureDevice, CaptureStatus, CaptureStream, FacingMode,
    Frame, VideoSink,
};
pub use config::AppConfig;
pub use detector::{Detection, DetectionModel, DetectorAdapter, DetectorLoader, DetectorRegistry};
pub use error::{KioskError, Result};
pub use inference::{FastVlmAnalysis, InferenceLoop, VisionLanguageModel};
pub use keywords::KeywordReport;
pub use modality::Modality;
pub use preset::{HudConfig, HudOverrides, Preset};
pub use scene::{SceneCatalog, SceneDescriptor};
pub use scheduler::DetectionScheduler;
pub use session::{PerceptionSession, SessionParts};
pub use state::{ModuleState, ModuleStore};
pub use store::AppStore;
pub use transition::{
    TransitionCallbacks, TransitionEvent, TransitionMachine, TransitionPhase, TransitionVariant,
};
pub use transport::{Connection, ConnectionStatus, Connector, TransportClient};
