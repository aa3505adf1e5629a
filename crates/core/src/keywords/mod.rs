//! Engagement keyword extraction for vision-language output.
//!
//! Matching is substring based over the lower-cased text so multi-word cues
//! ("leaning forward", "eye contact") are found as written. Positive cues are
//! discarded when a negation word appears in the 30 characters before them.

use serde::Serialize;

use crate::detector::SentimentLabel;

const NEGATION_WINDOW: usize = 30;

#[rustfmt::skip]
const POSITIVE: &[&str] = &[
    "engaged", "attentive", "focused", "interested", "participative", "active", "alert",
    "concentrated", "involved", "enthusiastic", "smiling", "happy", "excited", "nodding",
    "leaning forward", "eye contact", "looking at", "watching", "listening", "paying attention",
    "energetic", "animated", "vibrant", "lively", "eager", "curious", "responsive", "expressive",
    "bright", "cheerful", "positive", "upbeat", "motivated", "open", "receptive",
];

#[rustfmt::skip]
const NEUTRAL: &[&str] = &[
    "neutral", "calm", "relaxed", "composed", "steady", "sitting", "present", "quiet", "still",
    "stable",
];

#[rustfmt::skip]
const NEGATIVE: &[&str] = &[
    "distracted", "bored", "disengaged", "uninterested", "withdrawn", "passive", "tired",
    "fatigued", "sleepy", "drowsy", "looking away", "looking down", "checking phone", "yawning",
    "slouching", "leaning back", "arms crossed", "frowning", "confused", "unhappy", "sad",
    "frustrated", "worried",
];

#[rustfmt::skip]
const NEGATIONS: &[&str] = &[
    "not", "no", "never", "neither", "none", "nobody", "nothing", "nowhere", "hardly", "barely",
    "scarcely", "doesn't", "don't", "isn't", "aren't", "wasn't", "weren't", "won't", "wouldn't",
    "without",
];

#[rustfmt::skip]
const OPEN_POSTURE: &[&str] = &[
    "leaning forward", "open posture", "relaxed shoulders", "uncrossed arms", "upright",
];
#[rustfmt::skip]
const CLOSED_POSTURE: &[&str] = &[
    "arms crossed", "leaning back", "slouching", "turned away", "hunched",
];
#[rustfmt::skip]
const ACTIVE_GESTURES: &[&str] = &["gesturing", "hand raised", "nodding", "moving", "pointing"];

#[rustfmt::skip]
const POSITIVE_EMOTIONS: &[&str] = &[
    "happy", "smiling", "pleased", "content", "excited", "surprised", "delighted", "joyful",
    "enthusiastic", "cheerful", "bright", "positive", "upbeat", "animated", "expressive",
    "energetic", "lively",
];
#[rustfmt::skip]
const NEGATIVE_EMOTIONS: &[&str] = &[
    "sad", "frustrated", "angry", "confused", "worried", "concerned", "upset",
];
#[rustfmt::skip]
const NEUTRAL_EMOTIONS: &[&str] = &["neutral", "calm", "composed", "expressionless", "blank"];

/// Categorised keyword hits plus the contextual score derived from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordReport {
    pub positive: Vec<String>,
    pub neutral: Vec<String>,
    pub negative: Vec<String>,
    pub open_posture: Vec<String>,
    pub closed_posture: Vec<String>,
    pub active_gestures: Vec<String>,
    pub positive_emotions: Vec<String>,
    pub negative_emotions: Vec<String>,
    pub neutral_emotions: Vec<String>,
    /// In `[0, 1]`; 0.5 is neutral.
    pub contextual_score: f32,
    pub dominant_sentiment: SentimentLabel,
}

impl Default for KeywordReport {
    fn default() -> Self {
        Self {
            positive: Vec::new(),
            neutral: Vec::new(),
            negative: Vec::new(),
            open_posture: Vec::new(),
            closed_posture: Vec::new(),
            active_gestures: Vec::new(),
            positive_emotions: Vec::new(),
            negative_emotions: Vec::new(),
            neutral_emotions: Vec::new(),
            contextual_score: 0.5,
            dominant_sentiment: SentimentLabel::Neutral,
        }
    }
}

impl KeywordReport {
    /// Engagement keywords (positive, negative, neutral) without duplicates.
    pub fn engagement_keywords(&self) -> Vec<String> {
        let mut keywords: Vec<String> = Vec::new();
        for keyword in self.positive.iter().chain(&self.negative).chain(&self.neutral) {
            if !keywords.contains(keyword) {
                keywords.push(keyword.clone());
            }
        }
        keywords
    }
}

/// Parses final model text into a [`KeywordReport`].
pub fn parse(text: &str) -> KeywordReport {
    let text = text.trim();
    if text.is_empty() {
        return KeywordReport::default();
    }
    let lower = text.to_lowercase();

    let mut report = KeywordReport {
        positive: positive_matches(&lower),
        neutral: matches(&lower, NEUTRAL),
        negative: matches(&lower, NEGATIVE),
        open_posture: matches(&lower, OPEN_POSTURE),
        closed_posture: matches(&lower, CLOSED_POSTURE),
        active_gestures: matches(&lower, ACTIVE_GESTURES),
        positive_emotions: matches(&lower, POSITIVE_EMOTIONS),
        negative_emotions: matches(&lower, NEGATIVE_EMOTIONS),
        neutral_emotions: matches(&lower, NEUTRAL_EMOTIONS),
        ..Default::default()
    };
    report.contextual_score = contextual_score(&report);
    report.dominant_sentiment = dominant_sentiment(&report);
    report
}

fn matches(text: &str, lexicon: &[&str]) -> Vec<String> {
    lexicon
        .iter()
        .filter(|keyword| text.contains(*keyword))
        .map(|keyword| keyword.to_string())
        .collect()
}

fn positive_matches(text: &str) -> Vec<String> {
    POSITIVE
        .iter()
        .filter(|keyword| text.contains(*keyword) && !is_negated(text, keyword))
        .map(|keyword| keyword.to_string())
        .collect()
}

fn is_negated(text: &str, keyword: &str) -> bool {
    let Some(position) = text.find(keyword) else {
        return false;
    };
    let mut start = position.saturating_sub(NEGATION_WINDOW);
    while !text.is_char_boundary(start) {
        start += 1;
    }

    text[start..position]
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .any(|word| NEGATIONS.contains(&word))
}

fn contextual_score(report: &KeywordReport) -> f32 {
    let mut score = 0.5_f32;

    score += (report.positive.len() as f32 * 0.08).min(0.4);
    score -= (report.negative.len() as f32 * 0.08).min(0.4);

    if !report.open_posture.is_empty() {
        score += 0.15;
    }
    if !report.closed_posture.is_empty() {
        score -= 0.15;
    }
    if !report.active_gestures.is_empty() {
        score += 0.15;
    }

    if !report.positive_emotions.is_empty() {
        score += (report.positive_emotions.len() as f32 * 0.08).min(0.25);
    }
    if !report.negative_emotions.is_empty() {
        score -= 0.15;
    }

    score += (report.neutral.len() as f32 * 0.02).min(0.05);
    score.clamp(0.0, 1.0)
}

fn dominant_sentiment(report: &KeywordReport) -> SentimentLabel {
    let positive = report.positive.len();
    let neutral = report.neutral.len();
    let negative = report.negative.len();

    if positive > negative && positive > neutral {
        SentimentLabel::Positive
    } else if negative > positive && negative > neutral {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    }
}
