use std::sync::Arc;

use serde::Serialize;

use crate::{
    detector::{
        BioReading, Detection, FaceReading, HandReading, ObjectReading, PoseReading, SpeechReading,
    },
    preset::HudConfig,
    state::ModuleStore,
    Modality,
};

/// One aggregated, immutable read of every modality.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VisionData {
    pub face: Option<Arc<Detection>>,
    pub pose: Option<Arc<Detection>>,
    pub hands: Option<Arc<Detection>>,
    pub objects: Option<Arc<Detection>>,
    pub bio: Option<Arc<Detection>>,
    pub speech: Option<Arc<Detection>>,
    /// Strictly increasing across snapshots of one aggregator.
    pub last_update: u64,
}

impl VisionData {
    pub fn get(&self, modality: Modality) -> Option<&Arc<Detection>> {
        match modality {
            Modality::Face => self.face.as_ref(),
            Modality::Pose => self.pose.as_ref(),
            Modality::Hands => self.hands.as_ref(),
            Modality::Objects => self.objects.as_ref(),
            Modality::Bio => self.bio.as_ref(),
            Modality::Speech => self.speech.as_ref(),
        }
        .filter(|detection| detection.modality() == modality)
    }

    fn slot_mut(&mut self, modality: Modality) -> &mut Option<Arc<Detection>> {
        match modality {
            Modality::Face => &mut self.face,
            Modality::Pose => &mut self.pose,
            Modality::Hands => &mut self.hands,
            Modality::Objects => &mut self.objects,
            Modality::Bio => &mut self.bio,
            Modality::Speech => &mut self.speech,
        }
    }

    pub fn face_landmarks(&self) -> Option<&FaceReading> {
        match self.get(Modality::Face).map(Arc::as_ref) {
            Some(Detection::Face(reading)) => Some(reading),
            _ => None,
        }
    }

    pub fn pose_landmarks(&self) -> Option<&PoseReading> {
        match self.get(Modality::Pose).map(Arc::as_ref) {
            Some(Detection::Pose(reading)) => Some(reading),
            _ => None,
        }
    }

    pub fn hand_landmarks(&self) -> Option<&HandReading> {
        match self.get(Modality::Hands).map(Arc::as_ref) {
            Some(Detection::Hands(reading)) => Some(reading),
            _ => None,
        }
    }

    pub fn detected_objects(&self) -> Option<&ObjectReading> {
        match self.get(Modality::Objects).map(Arc::as_ref) {
            Some(Detection::Objects(reading)) => Some(reading),
            _ => None,
        }
    }

    pub fn bio(&self) -> Option<&BioReading> {
        match self.get(Modality::Bio).map(Arc::as_ref) {
            Some(Detection::Bio(reading)) => Some(reading),
            _ => None,
        }
    }

    pub fn speech(&self) -> Option<&SpeechReading> {
        match self.get(Modality::Speech).map(Arc::as_ref) {
            Some(Detection::Speech(reading)) => Some(reading),
            _ => None,
        }
    }

    /// Modalities that currently contribute a result.
    pub fn present(&self) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|modality| self.get(*modality).is_some())
            .collect()
    }
}

/// Combines the per-modality store into [`VisionData`] snapshots.
#[derive(Debug, Default)]
pub struct VisionAggregator {
    last_update: u64,
}

impl VisionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from the store's current slots. Modalities disabled
    /// by `config` are always `None`, whatever the store still caches.
    pub fn compose(&mut self, store: &ModuleStore, config: &HudConfig, now_ms: u64) -> VisionData {
        let slots = store.snapshot();
        let mut data = VisionData::default();

        for modality in Modality::ALL {
            if !config.modalities.is_enabled(modality) {
                continue;
            }
            *data.slot_mut(modality) = slots[modality.index()].latest.clone();
        }

        self.last_update = now_ms.max(self.last_update + 1);
        data.last_update = self.last_update;
        data
    }
}
