use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A single rollback step that undoes one document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Put back the previous serialized content of a document file.
    RestoreFile { path: PathBuf, content: String },
    /// Remove a document file the batch created.
    RemoveFile(PathBuf),
}

/// A WAL entry representing an in-flight batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub batch: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log for crash recovery.
///
/// The file store records the previous content of every document a batch
/// touches before writing any of them, and removes the entry once all
/// writes are durable. On open, incomplete entries are rolled back so a
/// batch is either fully applied or not applied at all.
pub struct WriteAheadLog {
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            wal_dir: layout.wal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Record a batch and its rollback steps. Returns the op id.
    pub fn begin(
        &self,
        batch: &str,
        rollback_steps: Vec<RollbackStep>,
    ) -> Result<String, StoreError> {
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%6f"),
            &blake3::hash(batch.as_bytes()).to_hex()[..8]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            batch: batch.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps,
        };
        self.write_entry(&entry)?;
        debug!(
            "WAL begin: {} steps for [{batch}] (op_id={op_id})",
            entry.rollback_steps.len()
        );
        Ok(op_id)
    }

    /// Remove a WAL entry after every write of its batch is durable.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            // A torn entry means the batch never started writing.
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.op_id.cmp(&b.op_id));
        Ok(entries)
    }

    /// Roll back all incomplete entries, newest first. Returns how many.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let count = entries.len();
        for entry in entries.iter().rev() {
            info!(
                "WAL recovery: rolling back batch [{}] (op_id={})",
                entry.batch, entry.op_id
            );
            Self::rollback_entry(entry);
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn rollback_entry(entry: &WalEntry) {
        for step in entry.rollback_steps.iter().rev() {
            match step {
                RollbackStep::RemoveFile(path) => {
                    if path.exists() {
                        if let Err(e) = fs::remove_file(path) {
                            warn!(
                                "WAL rollback: failed to remove file {}: {e}",
                                path.display()
                            );
                        } else {
                            debug!("WAL rollback: removed file {}", path.display());
                        }
                    }
                }
                RollbackStep::RestoreFile { path, content } => {
                    if let Err(e) = write_atomic(path, content) {
                        warn!(
                            "WAL rollback: failed to restore {}: {e}",
                            path.display()
                        );
                    } else {
                        debug!("WAL rollback: restored {}", path.display());
                    }
                }
            }
        }
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        write_atomic(&self.entry_path(&entry.op_id), &content)
    }
}

/// Write `content` to `dest` through a temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &str) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("path has no parent")))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    crate::fsync_dir(dir)?;
    Ok(())
}
