use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::{detector::Detection, Modality};

/// Lifecycle and health of one modality.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModuleState {
    pub enabled: bool,
    pub ready: bool,
    pub loading: bool,
    pub error: Option<String>,
    /// Milliseconds since the session epoch of the last detection attempt.
    pub last_update_ms: Option<u64>,
    pub observed_fps: f32,
}

/// What a modality has published: its state plus latest result.
#[derive(Debug, Clone, Default)]
pub struct ModalitySlot {
    pub state: ModuleState,
    pub latest: Option<Arc<Detection>>,
}

/// Per-modality observable state.
///
/// Each slot is replaced as a whole, so readers never see a half-written
/// state/result pair. Writes are crate-private: only schedulers mutate slots.
#[derive(Debug)]
pub struct ModuleStore {
    epoch: Instant,
    slots: [watch::Sender<ModalitySlot>; Modality::COUNT],
}

impl Default for ModuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            slots: std::array::from_fn(|_| watch::channel(ModalitySlot::default()).0),
        }
    }

    /// Session epoch every millisecond timestamp is measured from.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn millis_since_epoch(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn now_ms(&self) -> u64 {
        self.millis_since_epoch(Instant::now())
    }

    pub fn slot(&self, modality: Modality) -> ModalitySlot {
        self.slots[modality.index()].borrow().clone()
    }

    pub fn state(&self, modality: Modality) -> ModuleState {
        self.slots[modality.index()].borrow().state.clone()
    }

    pub fn latest(&self, modality: Modality) -> Option<Arc<Detection>> {
        self.slots[modality.index()].borrow().latest.clone()
    }

    pub fn subscribe(&self, modality: Modality) -> watch::Receiver<ModalitySlot> {
        self.slots[modality.index()].subscribe()
    }

    /// Reads every slot once.
    pub fn snapshot(&self) -> [ModalitySlot; Modality::COUNT] {
        std::array::from_fn(|index| self.slots[index].borrow().clone())
    }

    pub(crate) fn update(&self, modality: Modality, write: impl FnOnce(&mut ModalitySlot)) {
        self.slots[modality.index()].send_modify(write);
    }
}
