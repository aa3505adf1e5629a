use serde::{Deserialize, Serialize};

use crate::Modality;

/// Normalised image-space landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f32>,
}

/// Normalised `[0, 1]` box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMesh {
    pub landmarks: Vec<Landmark>,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceReading {
    pub faces: Vec<FaceMesh>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseReading {
    pub landmarks: Vec<Landmark>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handedness {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gesture {
    pub name: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hand {
    pub handedness: Handedness,
    pub landmarks: Vec<Landmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<Gesture>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandReading {
    pub hands: Vec<Hand>,
}

impl HandReading {
    /// Recognised gesture names, strongest first.
    pub fn gestures(&self) -> Vec<&str> {
        let mut gestures: Vec<&Gesture> = self
            .hands
            .iter()
            .filter_map(|hand| hand.gesture.as_ref())
            .collect();
        gestures.sort_by(|a, b| b.score.total_cmp(&a.score));
        gestures.into_iter().map(|gesture| gesture.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub score: f32,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectReading {
    pub objects: Vec<DetectedObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionScore {
    pub label: String,
    pub score: f32,
}

/// Attributes derived from the face: expressions, apparent age, attention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BioReading {
    pub expressions: Vec<ExpressionScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_estimate: Option<f32>,
    pub attention: f32,
}

impl BioReading {
    pub fn dominant_expression(&self) -> Option<&ExpressionScore> {
        self.expressions.iter().max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechReading {
    pub transcript: String,
    pub is_final: bool,
    pub sentiment: Sentiment,
}

/// Result of one successful detection, tagged by modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum Detection {
    Face(FaceReading),
    Pose(PoseReading),
    Hands(HandReading),
    Objects(ObjectReading),
    Bio(BioReading),
    Speech(SpeechReading),
}

impl Detection {
    pub fn modality(&self) -> Modality {
        match self {
            Detection::Face(_) => Modality::Face,
            Detection::Pose(_) => Modality::Pose,
            Detection::Hands(_) => Modality::Hands,
            Detection::Objects(_) => Modality::Objects,
            Detection::Bio(_) => Modality::Bio,
            Detection::Speech(_) => Modality::Speech,
        }
    }
}
