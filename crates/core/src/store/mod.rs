//! Cross-scene application state.

use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::{sync::watch, time::Instant};

/// Engagement payload as last received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementRecord {
    /// Opaque to this crate.
    pub data: Value,
    pub received_at: Instant,
}

/// Holds the displayed scene index and the backend engagement cache.
#[derive(Debug)]
pub struct AppStore {
    scene: watch::Sender<usize>,
    engagement: RwLock<Option<EngagementRecord>>,
    freshness: Duration,
}

impl AppStore {
    pub fn new(freshness: Duration) -> Self {
        let (scene, _) = watch::channel(0);
        Self {
            scene,
            engagement: RwLock::new(None),
            freshness,
        }
    }

    pub fn scene_index(&self) -> usize {
        *self.scene.borrow()
    }

    /// Sets the displayed scene. Returns whether it changed; subscribers are
    /// only notified when it did.
    pub fn set_scene(&self, index: usize) -> bool {
        let changed = self.scene.send_if_modified(|current| {
            if *current == index {
                false
            } else {
                *current = index;
                true
            }
        });
        if changed {
            tracing::info!(scene = index, "scene changed");
        }
        changed
    }

    pub fn subscribe_scene(&self) -> watch::Receiver<usize> {
        self.scene.subscribe()
    }

    pub fn record_engagement(&self, data: Value) {
        self.record_engagement_at(data, Instant::now());
    }

    pub fn record_engagement_at(&self, data: Value, received_at: Instant) {
        *self.engagement.write() = Some(EngagementRecord { data, received_at });
    }

    /// Last record regardless of age.
    pub fn engagement(&self) -> Option<EngagementRecord> {
        self.engagement.read().clone()
    }

    /// Last record if it was received within the freshness window of `now`.
    pub fn fresh_engagement(&self, now: Instant) -> Option<Value> {
        let engagement = self.engagement.read();
        engagement
            .as_ref()
            .filter(|record| now.saturating_duration_since(record.received_at) <= self.freshness)
            .map(|record| record.data.clone())
    }
}
