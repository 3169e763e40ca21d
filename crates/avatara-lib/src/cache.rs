//! Process-wide cache of loaded models, keyed by (model, avatar).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use avatara_core::error::ConfigError;
use avatara_core::types::ModelConfig;

use crate::features::FeatureExtractor;
use crate::renderer::{LoadedModel, load_model};

type Loader = Box<dyn Fn(&ModelConfig) -> Result<LoadedModel, ConfigError> + Send + Sync>;

pub struct AssetCache {
    models: Mutex<HashMap<(String, String), Arc<LoadedModel>>>,
    loader: Loader,
}

impl Default for AssetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetCache {
    pub fn new() -> Self {
        Self::with_loader(load_model)
    }

    pub fn with_loader(
        loader: impl Fn(&ModelConfig) -> Result<LoadedModel, ConfigError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            loader: Box::new(loader),
        }
    }

    /// Return the cached model, loading (and optionally warming up) on first
    /// use. The lock is held for the whole load so concurrent sessions for the
    /// same identity never load it twice.
    pub fn get_or_load(
        &self,
        config: &ModelConfig,
        batch_size: usize,
        extractor: &dyn FeatureExtractor,
    ) -> Result<Arc<LoadedModel>, ConfigError> {
        let key = (config.model.clone(), config.avatar_id.clone());
        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(model) = models.get(&key) {
            return Ok(model.clone());
        }

        info!("loading model {} / avatar {}", key.0, key.1);
        let model = Arc::new((self.loader)(config)?);
        if config.warm_up {
            if let Err(e) = model.warm_up(batch_size, extractor) {
                warn!("warm-up for {} failed: {e}", key.0);
            }
        }
        models.insert(key, model.clone());
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.models.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
