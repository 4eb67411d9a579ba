use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use super::{LocalModel, ModelKey, ModelLoader};
use crate::{BackendError, BackendResult};

struct CachedModel {
    key: ModelKey,
    model: Arc<dyn LocalModel>,
}

/// Process-wide single-slot model cache.
///
/// Holds at most one loaded model. Asking for a different key unloads the
/// resident model before the new one is loaded, so two sets of weights are
/// never resident at once. The slot lock is held across the load, which makes
/// concurrent first requests for the same key load it once.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Option<CachedModel>>,
    loads: AtomicUsize,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(None),
            loads: AtomicUsize::new(0),
        }
    }

    /// Blocking; call from a worker thread.
    pub fn get_or_load(&self, key: &ModelKey) -> BackendResult<Arc<dyn LocalModel>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| BackendError::ModelLoad("model cache lock poisoned".to_string()))?;

        if let Some(cached) = slot.as_ref().filter(|cached| &cached.key == key) {
            return Ok(Arc::clone(&cached.model));
        }

        if let Some(previous) = slot.take() {
            info!(model = %previous.key, "unloading resident model");
            drop(previous);
        }

        info!(model = %key, "loading model");
        let model = self.loader.load(key)?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        *slot = Some(CachedModel {
            key: key.clone(),
            model: Arc::clone(&model),
        });
        Ok(model)
    }

    /// Number of successful loads since the cache was created.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn cached_key(&self) -> Option<ModelKey> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|cached| cached.key.clone()))
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("cached_key", &self.cached_key())
            .field("loads", &self.loads())
            .finish()
    }
}
