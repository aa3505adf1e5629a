use std::fmt;

use serde::{Deserialize, Serialize};

/// One category of detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Face,
    Pose,
    Hands,
    Objects,
    Bio,
    Speech,
}

impl Modality {
    pub const COUNT: usize = 6;

    pub const ALL: [Modality; Modality::COUNT] = [
        Modality::Face,
        Modality::Pose,
        Modality::Hands,
        Modality::Objects,
        Modality::Bio,
        Modality::Speech,
    ];

    /// Stable position used to index per-modality arrays.
    pub fn index(self) -> usize {
        match self {
            Modality::Face => 0,
            Modality::Pose => 1,
            Modality::Hands => 2,
            Modality::Objects => 3,
            Modality::Bio => 4,
            Modality::Speech => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Face => "face",
            Modality::Pose => "pose",
            Modality::Hands => "hands",
            Modality::Objects => "objects",
            Modality::Bio => "bio",
            Modality::Speech => "speech",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
