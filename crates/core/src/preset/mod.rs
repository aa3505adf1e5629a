//! Named HUD presets and override resolution.
//!
//! The effective [`HudConfig`] of a scene is always
//! `resolve(preset_name, overrides)`: the named template with the overrides
//! laid on top. Nothing carries over from whatever config was active before.

use serde::{Deserialize, Serialize};

use crate::Modality;

/// Preset used when a scene asks for an unknown name.
pub const DEFAULT_PRESET: &str = "default";

/// Which modalities run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityToggles {
    pub face: bool,
    pub pose: bool,
    pub hands: bool,
    pub objects: bool,
    pub bio: bool,
    pub speech: bool,
}

impl ModalityToggles {
    pub const NONE: ModalityToggles = ModalityToggles {
        face: false,
        pose: false,
        hands: false,
        objects: false,
        bio: false,
        speech: false,
    };

    pub fn is_enabled(&self, modality: Modality) -> bool {
        match modality {
            Modality::Face => self.face,
            Modality::Pose => self.pose,
            Modality::Hands => self.hands,
            Modality::Objects => self.objects,
            Modality::Bio => self.bio,
            Modality::Speech => self.speech,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = Modality> + '_ {
        Modality::ALL.into_iter().filter(|modality| self.is_enabled(*modality))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    Cyan,
    Emerald,
    Magenta,
    Amber,
    Mono,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisualOptions {
    pub show_labels: bool,
    pub show_confidence: bool,
    pub show_skeleton: bool,
    pub show_grid: bool,
    pub opacity: f32,
    pub color_scheme: ColorScheme,
}

/// Effective HUD configuration of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HudConfig {
    pub modalities: ModalityToggles,
    pub visuals: VisualOptions,
}

impl HudConfig {
    pub fn with_overrides(mut self, overrides: &HudOverrides) -> Self {
        let toggles = &overrides.modalities;
        let modalities = &mut self.modalities;
        apply(&mut modalities.face, toggles.face);
        apply(&mut modalities.pose, toggles.pose);
        apply(&mut modalities.hands, toggles.hands);
        apply(&mut modalities.objects, toggles.objects);
        apply(&mut modalities.bio, toggles.bio);
        apply(&mut modalities.speech, toggles.speech);

        let visuals = &mut self.visuals;
        apply(&mut visuals.show_labels, overrides.show_labels);
        apply(&mut visuals.show_confidence, overrides.show_confidence);
        apply(&mut visuals.show_skeleton, overrides.show_skeleton);
        apply(&mut visuals.show_grid, overrides.show_grid);
        apply(&mut visuals.color_scheme, overrides.color_scheme);
        if let Some(opacity) = overrides.opacity {
            visuals.opacity = if opacity.is_finite() {
                opacity.clamp(0.0, 1.0)
            } else {
                visuals.opacity
            };
        }
        self
    }
}

fn apply<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityOverrides {
    pub face: Option<bool>,
    pub pose: Option<bool>,
    pub hands: Option<bool>,
    pub objects: Option<bool>,
    pub bio: Option<bool>,
    pub speech: Option<bool>,
}

/// Ad-hoc changes a scene lays on top of its named preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HudOverrides {
    pub modalities: ModalityOverrides,
    pub show_labels: Option<bool>,
    pub show_confidence: Option<bool>,
    pub show_skeleton: Option<bool>,
    pub show_grid: Option<bool>,
    pub opacity: Option<f32>,
    pub color_scheme: Option<ColorScheme>,
}

/// Named, immutable template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub config: HudConfig,
}

const fn visuals(
    labels: bool,
    confidence: bool,
    skeleton: bool,
    grid: bool,
    opacity: f32,
    color_scheme: ColorScheme,
) -> VisualOptions {
    VisualOptions {
        show_labels: labels,
        show_confidence: confidence,
        show_skeleton: skeleton,
        show_grid: grid,
        opacity,
        color_scheme,
    }
}

const fn toggles(
    face: bool,
    pose: bool,
    hands: bool,
    objects: bool,
    bio: bool,
    speech: bool,
) -> ModalityToggles {
    ModalityToggles {
        face,
        pose,
        hands,
        objects,
        bio,
        speech,
    }
}

static PRESETS: [Preset; 8] = [
    Preset {
        name: DEFAULT_PRESET,
        description: "Face, pose and hands with labels",
        config: HudConfig {
            modalities: toggles(true, true, true, false, false, false),
            visuals: visuals(true, false, true, false, 0.8, ColorScheme::Cyan),
        },
    },
    Preset {
        name: "minimal",
        description: "Face mesh only, no decorations",
        config: HudConfig {
            modalities: toggles(true, false, false, false, false, false),
            visuals: visuals(false, false, false, false, 0.5, ColorScheme::Mono),
        },
    },
    Preset {
        name: "face-focus",
        description: "Face mesh with expression read-outs",
        config: HudConfig {
            modalities: toggles(true, false, false, false, true, false),
            visuals: visuals(true, true, false, true, 0.9, ColorScheme::Cyan),
        },
    },
    Preset {
        name: "body-tracking",
        description: "Full-body skeleton",
        config: HudConfig {
            modalities: toggles(false, true, false, false, false, false),
            visuals: visuals(true, true, true, true, 0.85, ColorScheme::Emerald),
        },
    },
    Preset {
        name: "gesture",
        description: "Hand landmarks and recognised gestures",
        config: HudConfig {
            modalities: toggles(false, false, true, false, false, false),
            visuals: visuals(true, true, true, false, 0.9, ColorScheme::Magenta),
        },
    },
    Preset {
        name: "object-scan",
        description: "Object boxes with confidence",
        config: HudConfig {
            modalities: toggles(false, false, false, true, false, false),
            visuals: visuals(true, true, false, true, 0.8, ColorScheme::Amber),
        },
    },
    Preset {
        name: "bio-scan",
        description: "Face, expressions and speech sentiment",
        config: HudConfig {
            modalities: toggles(true, false, false, false, true, true),
            visuals: visuals(true, true, false, true, 0.9, ColorScheme::Emerald),
        },
    },
    Preset {
        name: "full-analysis",
        description: "Every modality",
        config: HudConfig {
            modalities: toggles(true, true, true, true, true, true),
            visuals: visuals(true, true, true, true, 0.75, ColorScheme::Cyan),
        },
    },
];

/// Looks a preset up by key, falling back to [`DEFAULT_PRESET`].
pub fn preset(name: &str) -> &'static Preset {
    match PRESETS.iter().find(|preset| preset.name == name) {
        Some(preset) => preset,
        None => {
            tracing::debug!(name, fallback = DEFAULT_PRESET, "unknown preset");
            &PRESETS[0]
        }
    }
}

pub fn presets() -> &'static [Preset] {
    &PRESETS
}

/// Effective config for `(name, overrides)`.
pub fn resolve(name: &str, overrides: &HudOverrides) -> HudConfig {
    preset(name).config.with_overrides(overrides)
}
