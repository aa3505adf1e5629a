use serde::{Deserialize, Serialize};

use crate::preset::{self, ColorScheme, HudConfig, HudOverrides, ModalityOverrides};

/// One scene of the kiosk sequence, described entirely by data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub index: usize,
    pub name: String,
    pub preset: String,
    #[serde(default)]
    pub overrides: HudOverrides,
}

impl SceneDescriptor {
    pub fn new(index: usize, name: impl Into<String>, preset: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            preset: preset.into(),
            overrides: HudOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: HudOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn effective_config(&self) -> HudConfig {
        preset::resolve(&self.preset, &self.overrides)
    }
}

/// Ordered list of scenes, indexed from the attract loop at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneCatalog {
    scenes: Vec<SceneDescriptor>,
}

impl Default for SceneCatalog {
    fn default() -> Self {
        let scenes = vec![
            SceneDescriptor::new(0, "attract", "minimal").with_overrides(HudOverrides {
                opacity: Some(0.3),
                ..Default::default()
            }),
            SceneDescriptor::new(1, "activation", preset::DEFAULT_PRESET),
            SceneDescriptor::new(2, "face-scan", "face-focus"),
            SceneDescriptor::new(3, "body-scan", "body-tracking"),
            SceneDescriptor::new(4, "gesture-lab", "gesture").with_overrides(HudOverrides {
                modalities: ModalityOverrides {
                    pose: Some(true),
                    ..Default::default()
                },
                show_skeleton: Some(false),
                ..Default::default()
            }),
            SceneDescriptor::new(5, "object-scan", "object-scan"),
            SceneDescriptor::new(6, "bio-readout", "bio-scan").with_overrides(HudOverrides {
                color_scheme: Some(ColorScheme::Magenta),
                ..Default::default()
            }),
        ];
        Self { scenes }
    }
}

impl SceneCatalog {
    /// Builds a catalog, re-numbering scenes by position.
    pub fn new(scenes: impl IntoIterator<Item = SceneDescriptor>) -> Self {
        let scenes = scenes
            .into_iter()
            .enumerate()
            .map(|(index, scene)| SceneDescriptor { index, ..scene })
            .collect();
        Self { scenes }
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SceneDescriptor> {
        self.scenes.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&SceneDescriptor> {
        self.scenes.iter().find(|scene| scene.name == name)
    }

    pub fn scenes(&self) -> &[SceneDescriptor] {
        &self.scenes
    }

    pub fn effective_config(&self, index: usize) -> Option<HudConfig> {
        self.get(index).map(SceneDescriptor::effective_config)
    }

    /// Scene after `index`; the last scene loops back to the attract scene.
    pub fn next_index(&self, index: usize) -> usize {
        if index + 1 < self.scenes.len() {
            index + 1
        } else {
            0
        }
    }
}
