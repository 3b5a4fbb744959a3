use crate::file::FileStore;
use crate::layout::StoreLayout;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub collections_checked: usize,
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
    pub incomplete_batches: usize,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub collection: String,
    pub document: String,
    pub reason: String,
}

/// Verify every document checksum of a file store and count WAL entries
/// that were never committed.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    layout.verify_version()?;
    let store = FileStore::attach(layout.clone());
    let collections = store.collections()?;

    let mut report = IntegrityReport {
        collections_checked: collections.len(),
        incomplete_batches: crate::WriteAheadLog::new(layout).list_incomplete()?.len(),
        ..Default::default()
    };

    for collection in &collections {
        for result in store.list_with_errors(collection)? {
            report.checked += 1;
            match result {
                Ok(_) => report.passed += 1,
                Err((name, StoreError::IntegrityFailure { id, actual, .. })) => {
                    report.failed.push(IntegrityFailure {
                        collection: collection.clone(),
                        document: id,
                        reason: format!("checksum mismatch in {name}: got {actual}"),
                    });
                }
                Err((name, e)) => {
                    report.failed.push(IntegrityFailure {
                        collection: collection.clone(),
                        document: name,
                        reason: format!("read error: {e}"),
                    });
                }
            }
        }
    }

    Ok(report)
}
