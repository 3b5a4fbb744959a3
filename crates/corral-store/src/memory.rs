use crate::apply::{plan_batch, BatchPlan};
use crate::document::{BatchOutcome, Condition, Document, Op};
use crate::{DocumentStore, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Document>>,
    sequences: HashMap<String, u64>,
}

/// An in-process document store. Batches are serialised by a mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn find_many(
        &self,
        collection: &str,
        conditions: &[Condition],
    ) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| d.matches(conditions))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn run_batch(&self, ops: &[Op]) -> Result<BatchOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let plan = plan_batch(ops, |collection, id| {
            Ok(inner
                .collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .cloned())
        })?;
        let writes = match plan {
            BatchPlan::Apply(writes) => writes,
            abort @ BatchPlan::Abort { .. } => return Ok(abort.outcome()),
        };
        debug!("memory store applying {} writes", writes.len());
        for write in writes {
            let docs = inner.collections.entry(write.collection).or_default();
            match write.next {
                Some(doc) => {
                    docs.insert(write.id, doc);
                }
                None => {
                    docs.remove(&write.id);
                }
            }
        }
        Ok(BatchOutcome::Applied)
    }

    fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let counter = inner.sequences.entry(name.to_owned()).or_insert(0);
        let value = *counter;
        *counter += 1;
        Ok(value)
    }
}
