use std::{collections::BTreeMap, sync::Arc};

use super::DetectorAdapter;
use crate::Modality;

/// Owns one shared [`DetectorAdapter`] per modality for the whole session.
///
/// Schedulers receive clones of the `Arc`; the primitives outlive any single
/// scene and are only torn down by [`DetectorRegistry::dispose_all`].
#[derive(Debug, Default)]
pub struct DetectorRegistry {
    adapters: BTreeMap<Modality, Arc<DetectorAdapter>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the same modality.
    pub fn register(&mut self, adapter: DetectorAdapter) -> Arc<DetectorAdapter> {
        let adapter = Arc::new(adapter);
        if self.adapters.insert(adapter.modality(), adapter.clone()).is_some() {
            tracing::warn!(modality = %adapter.modality(), "replaced registered detector");
        }
        adapter
    }

    pub fn get(&self, modality: Modality) -> Option<Arc<DetectorAdapter>> {
        self.adapters.get(&modality).cloned()
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.adapters.keys().copied()
    }

    pub async fn dispose_all(&self) {
        for adapter in self.adapters.values() {
            adapter.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::detector::testing::ScriptedLoader;

    #[tokio::test]
    async fn hands_out_the_same_adapter() {
        let mut registry = DetectorRegistry::new();
        registry.register(DetectorAdapter::new(
            Modality::Bio,
            ScriptedLoader::new(Modality::Bio, Duration::ZERO),
        ));

        let a = registry.get(Modality::Bio).unwrap();
        let b = registry.get(Modality::Bio).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get(Modality::Speech).is_none());

        a.initialize().await.unwrap();
        assert!(b.is_ready());
        registry.dispose_all().await;
        assert!(!a.is_ready());
    }
}
