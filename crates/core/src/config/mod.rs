use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{camera::FacingMode, KioskError, Modality, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub scheduler: SchedulerConfig,
    pub inference: InferenceConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections and fields take
    /// their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.frame_interval_ms == 0 {
            return Err(KioskError::Config(
                "scheduler.frame_interval_ms must be positive".into(),
            ));
        }
        if self.session.aggregation_interval_ms == 0 {
            return Err(KioskError::Config(
                "session.aggregation_interval_ms must be positive".into(),
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(KioskError::Config("camera resolution must be non-zero".into()));
        }
        Ok(())
    }
}

/// Preferred capture constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
    pub frame_rate: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            facing: FacingMode::User,
            frame_rate: 30,
        }
    }
}

/// Frame ticker period plus the per-modality throttle intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub frame_interval_ms: u64,
    pub face_interval_ms: u64,
    pub pose_interval_ms: u64,
    pub hands_interval_ms: u64,
    pub objects_interval_ms: u64,
    pub bio_interval_ms: u64,
    pub speech_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            face_interval_ms: 33,
            pose_interval_ms: 50,
            hands_interval_ms: 50,
            objects_interval_ms: 200,
            bio_interval_ms: 500,
            speech_interval_ms: 250,
        }
    }
}

impl SchedulerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn throttle(&self, modality: Modality) -> Duration {
        let ms = match modality {
            Modality::Face => self.face_interval_ms,
            Modality::Pose => self.pose_interval_ms,
            Modality::Hands => self.hands_interval_ms,
            Modality::Objects => self.objects_interval_ms,
            Modality::Bio => self.bio_interval_ms,
            Modality::Speech => self.speech_interval_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Vision-language loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub enabled: bool,
    pub prompt: String,
    pub loop_delay_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt: "Describe the person's level of engagement, facial expression and body \
                     language in one short sentence."
                .to_string(),
            loop_delay_ms: 250,
        }
    }
}

impl InferenceConfig {
    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }
}

/// Backend socket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub send_interval_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "ws://localhost:8000/ws/kiosk".to_string(),
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 3_000,
            send_interval_ms: 1_000,
            ping_interval_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }
}

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub initial_preset: String,
    pub aggregation_interval_ms: u64,
    pub engagement_freshness_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_preset: crate::preset::DEFAULT_PRESET.to_string(),
            aggregation_interval_ms: 100,
            engagement_freshness_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_millis(self.aggregation_interval_ms)
    }

    pub fn engagement_freshness(&self) -> Duration {
        Duration::from_millis(self.engagement_freshness_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"transport": {"max_reconnect_attempts": 5}}"#).unwrap();

        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.transport.reconnect_delay_ms, 3_000);
        assert_eq!(config.camera, CameraConfig::default());
        assert_eq!(config.session.initial_preset, "default");
    }

    #[test]
    fn throttle_lookup_follows_modality() {
        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.throttle(Modality::Objects), Duration::from_millis(200));
        assert_eq!(scheduler.throttle(Modality::Face), Duration::from_millis(33));
    }

    #[test]
    fn rejects_zero_frame_interval() {
        let mut config = AppConfig::default();
        config.scheduler.frame_interval_ms = 0;
        assert!(matches!(config.validate(), Err(KioskError::Config(_))));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("kiosk-config-{}.json", std::process::id()));
        let mut expected = AppConfig::default();
        expected.session.initial_preset = "minimal".into();
        std::fs::write(&path, expected.to_json_pretty().unwrap()).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, expected);
    }
}
