use corral_schema::ModelUuid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: u64,
    pub model_uuid: ModelUuid,
    pub backend: &'static str,
    pub opened_at: String,
}

/// Tracks open `State` instances. Injected at open time; `State::open`
/// registers and `State::close` unregisters.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, InstanceInfo>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model_uuid: &ModelUuid, backend: &'static str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = InstanceInfo {
            id,
            model_uuid: model_uuid.clone(),
            backend,
            opened_at: chrono::Utc::now().to_rfc3339(),
        };
        self.live.lock().insert(id, info);
        debug!("registered state instance {id} for model {model_uuid}");
        id
    }

    /// Returns false when the instance was not registered.
    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.live.lock().remove(&id).is_some();
        if removed {
            debug!("unregistered state instance {id}");
        }
        removed
    }

    pub fn live(&self) -> Vec<InstanceInfo> {
        self.live.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}
