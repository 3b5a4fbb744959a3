use crate::apply::{plan_batch, BatchPlan};
use crate::document::{BatchOutcome, Condition, Document, Op};
use crate::layout::{encode_id, StoreLayout};
use crate::lock::StoreLock;
use crate::wal::{write_atomic, RollbackStep, WriteAheadLog};
use crate::{fsync_dir, DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// On-disk form of a document, with an embedded blake3 checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub revno: u64,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StoredDocument {
    fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut stored = Self {
            id: doc.id.clone(),
            revno: doc.revno,
            body: doc.body.clone(),
            checksum: None,
        };
        stored.checksum = Some(stored.compute_checksum()?);
        Ok(stored)
    }

    /// Checksum over the document content, excluding the checksum field.
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    fn into_document(self) -> Document {
        Document {
            id: self.id,
            revno: self.revno,
            body: self.body,
        }
    }
}

/// A crash-safe document store on the local filesystem.
///
/// Every batch runs under the exclusive store lock, records the previous
/// content of each touched document in the WAL, applies its writes with
/// atomic renames, and then commits the WAL entry.
pub struct FileStore {
    layout: StoreLayout,
    wal: WriteAheadLog,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        let wal = WriteAheadLog::new(&layout);
        wal.initialize()?;

        match StoreLock::try_acquire(&layout.lock_file())? {
            Some(_lock) => {
                if let Err(e) = wal.recover() {
                    warn!("WAL recovery failed: {e}");
                }
            }
            None => debug!("store lock held; skipping WAL recovery"),
        }

        Ok(Self { layout, wal })
    }

    /// Use an initialized layout without running WAL recovery.
    pub(crate) fn attach(layout: StoreLayout) -> Self {
        let wal = WriteAheadLog::new(&layout);
        Self { layout, wal }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Names of all collections that have a directory on disk.
    pub fn collections(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.collections_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every document file of a collection, keeping per-file read errors so
    /// integrity checks can surface them.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
        collection: &str,
    ) -> Result<Vec<Result<Document, (String, StoreError)>>, StoreError> {
        let dir = self.layout.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match read_document_file(&entry.path()) {
                Ok(doc) => results.push(Ok(doc)),
                Err(e) => results.push(Err((name, e))),
            }
        }
        Ok(results)
    }

    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.layout.document_path(collection, id);
        if !path.exists() {
            return Ok(None);
        }
        read_document_file(&path).map(Some)
    }

    fn apply(&self, ops: &[Op]) -> Result<BatchOutcome, StoreError> {
        let plan = plan_batch(ops, |collection, id| self.read(collection, id))?;
        let writes = match plan {
            BatchPlan::Apply(writes) => writes,
            abort @ BatchPlan::Abort { .. } => return Ok(abort.outcome()),
        };
        if writes.is_empty() {
            return Ok(BatchOutcome::Applied);
        }

        let mut steps = Vec::with_capacity(writes.len());
        for write in &writes {
            let path = self.layout.document_path(&write.collection, &write.id);
            match &write.previous {
                Some(prev) => steps.push(RollbackStep::RestoreFile {
                    path,
                    content: serde_json::to_string_pretty(&StoredDocument::from_document(
                        prev,
                    )?)?,
                }),
                None => steps.push(RollbackStep::RemoveFile(path)),
            }
        }
        let label = writes
            .iter()
            .map(|w| format!("{}/{}", w.collection, w.id))
            .collect::<Vec<_>>()
            .join(" ");
        let op_id = self.wal.begin(&label, steps)?;

        for write in &writes {
            let path = self.layout.document_path(&write.collection, &write.id);
            match &write.next {
                Some(doc) => {
                    let stored = StoredDocument::from_document(doc)?;
                    let content = serde_json::to_string_pretty(&stored)?;
                    write_atomic(&path, &content)?;
                }
                None => {
                    if path.exists() {
                        fs::remove_file(&path)?;
                        if let Some(dir) = path.parent() {
                            fsync_dir(dir)?;
                        }
                    }
                }
            }
        }

        self.wal.commit(&op_id)?;
        debug!("file store applied {} writes", writes.len());
        Ok(BatchOutcome::Applied)
    }
}

fn read_document_file(path: &Path) -> Result<Document, StoreError> {
    let content = fs::read_to_string(path)?;
    let stored: StoredDocument = serde_json::from_str(&content)?;
    if let Some(ref expected) = stored.checksum {
        let actual = stored.compute_checksum()?;
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                id: stored.id.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(stored.into_document())
}

impl DocumentStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let _lock = StoreLock::acquire_shared(&self.layout.lock_file())?;
        self.read(collection, id)
    }

    fn find_many(
        &self,
        collection: &str,
        conditions: &[Condition],
    ) -> Result<Vec<Document>, StoreError> {
        let _lock = StoreLock::acquire_shared(&self.layout.lock_file())?;
        let mut docs = Vec::new();
        for result in self.list_with_errors(collection)? {
            match result {
                Ok(doc) if doc.matches(conditions) => docs.push(doc),
                Ok(_) => {}
                Err((name, e)) => warn!("skipping unreadable document {collection}/{name}: {e}"),
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    fn run_batch(&self, ops: &[Op]) -> Result<BatchOutcome, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        self.apply(ops)
    }

    fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let path = self.layout.sequences_dir().join(encode_id(name));
        let current = if path.exists() {
            let content = fs::read_to_string(&path)?;
            content.trim().parse::<u64>().map_err(|e| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("sequence '{name}' is corrupt: {e}"),
                ))
            })?
        } else {
            0
        };
        write_atomic(&path, &(current + 1).to_string())?;
        Ok(current)
    }
}
