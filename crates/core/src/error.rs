use crate::Modality;

/// Result alias that carries the custom [`KioskError`] type.
pub type Result<T> = std::result::Result<T, KioskError>;

/// Common error type for the core crate.
///
/// Only [`KioskError::PermissionDenied`], [`KioskError::DeviceUnavailable`]
/// and an exhausted transport are meant to reach the user. Every other variant
/// is absorbed and logged by the loop that produced it.
#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    /// Free-form message for failures that do not deserve their own variant.
    #[error("{0}")]
    Message(String),
    /// The user (or the platform) refused camera access.
    #[error("camera permission denied")]
    PermissionDenied,
    /// No capture device matched the requested constraints, or it is busy.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    /// A detector primitive could not be constructed.
    #[error("{modality} detector failed to initialize: {reason}")]
    InitializationFailed { modality: Modality, reason: String },
    /// Transient per-frame detection failure.
    #[error("detection failed: {0}")]
    Detection(String),
    /// Vision-language inference failed for one cycle.
    #[error("inference failed: {0}")]
    Inference(String),
    /// Socket level failure reported by the transport collaborator.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Configuration could not be interpreted.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl KioskError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Whether the failure must be surfaced to the person at the kiosk.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::DeviceUnavailable(_))
    }
}

impl From<&str> for KioskError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for KioskError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_capture_errors_are_user_visible() {
        assert!(KioskError::PermissionDenied.is_user_visible());
        assert!(KioskError::DeviceUnavailable("busy".into()).is_user_visible());
        assert!(!KioskError::Detection("blurry".into()).is_user_visible());
        assert!(!KioskError::from("plain").is_user_visible());
    }

    #[test]
    fn initialization_failure_names_the_modality() {
        let err = KioskError::InitializationFailed {
            modality: Modality::Pose,
            reason: "model missing".into(),
        };
        assert_eq!(format!("{err}"), "pose detector failed to initialize: model missing");
    }
}
