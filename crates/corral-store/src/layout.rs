use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current on-disk format version of the file store.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a file-backed document store.
///
/// ```text
/// <root>/store/
///   collections/<collection>/<hex-id>.json
///   sequences/<name>
///   wal/<op-id>.json
///   version
///   .lock
/// ```
///
/// Document ids contain `:` and `/`, so file names are the hex encoding of
/// the id bytes.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn collections_dir(&self) -> PathBuf {
        self.store_dir().join("collections")
    }

    #[inline]
    pub fn collection_dir(&self, collection: &str) -> PathBuf {
        self.collections_dir().join(collection)
    }

    pub fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", encode_id(id)))
    }

    #[inline]
    pub fn sequences_dir(&self) -> PathBuf {
        self.store_dir().join("sequences")
    }

    #[inline]
    pub fn wal_dir(&self) -> PathBuf {
        self.store_dir().join("wal")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.collections_dir())?;
        fs::create_dir_all(self.sequences_dir())?;
        fs::create_dir_all(self.wal_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.store_dir();
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

pub(crate) fn encode_id(id: &str) -> String {
    id.bytes().fold(String::with_capacity(id.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/corral-test");
        assert_eq!(
            layout.collections_dir(),
            PathBuf::from("/tmp/corral-test/store/collections")
        );
        assert_eq!(
            layout.collection_dir("units"),
            PathBuf::from("/tmp/corral-test/store/collections/units")
        );
        assert_eq!(
            layout.sequences_dir(),
            PathBuf::from("/tmp/corral-test/store/sequences")
        );
        assert_eq!(layout.wal_dir(), PathBuf::from("/tmp/corral-test/store/wal"));
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/tmp/corral-test/store/.lock")
        );
    }

    #[test]
    fn document_paths_are_hex_encoded() {
        let layout = StoreLayout::new("/tmp/corral-test");
        assert_eq!(
            layout.document_path("units", "m:a/0"),
            PathBuf::from("/tmp/corral-test/store/collections/units/6d3a612f30.json")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.collections_dir().is_dir());
        assert!(layout.sequences_dir().is_dir());
        assert!(layout.wal_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn version_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(
            layout.store_dir().join(VERSION_FILE),
            r#"{"format_version": 99}"#,
        )
        .unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: 99
            })
        ));
    }
}
