//! Retention of completed check-ins and imported documents.
//!
//! Completed meeting/session records are kept for the data-sharing
//! retention window and evicted afterwards; imported documents are swept
//! on a per-type retention schedule. Eviction is the only mutation here,
//! and it runs over the storage collaborator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::document::Document;
use crate::storage::{keys, KeyValueStore, KeyValueStoreExt, StorageError};

/// How long completed check-ins stay recomputable for a health authority.
pub const CHECK_IN_RETENTION: Duration = Duration::days(28);

/// A completed (checked-out) session at a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedCheckIn {
    pub trace_id: String,
    pub check_in: i64,
    pub check_out: i64,
}

pub struct Archiver {
    store: Arc<dyn KeyValueStore>,
    retention: Duration,
}

impl Archiver {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            retention: CHECK_IN_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Append a completed check-in to the archive.
    pub async fn record(&self, entry: ArchivedCheckIn) -> Result<(), StorageError> {
        let mut entries: Vec<ArchivedCheckIn> = self
            .store
            .restore_or_default(keys::ARCHIVED_CHECK_INS)
            .await?;
        entries.push(entry);
        self.store.persist(keys::ARCHIVED_CHECK_INS, &entries).await
    }

    pub async fn all(&self) -> Result<Vec<ArchivedCheckIn>, StorageError> {
        self.store.restore_or_default(keys::ARCHIVED_CHECK_INS).await
    }

    /// Evict check-ins that left the retention window. Returns the number
    /// of evicted records.
    pub async fn prune(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let cutoff = now.unix_timestamp() - self.retention.whole_seconds();
        let entries: Vec<ArchivedCheckIn> = self
            .store
            .restore_or_default(keys::ARCHIVED_CHECK_INS)
            .await?;
        let kept: Vec<ArchivedCheckIn> = entries
            .iter()
            .filter(|e| e.check_out >= cutoff)
            .cloned()
            .collect();
        let evicted = entries.len() - kept.len();
        if evicted > 0 {
            tracing::debug!(evicted, "pruned archived check-ins");
            self.store.persist(keys::ARCHIVED_CHECK_INS, &kept).await?;
        }
        Ok(evicted)
    }

    /// Sweep imported documents past their per-type retention period.
    pub async fn prune_documents(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let documents: Vec<Document> = self.store.restore_or_default(keys::DOCUMENTS).await?;
        let kept: Vec<Document> = documents
            .iter()
            .filter(|d| {
                let cutoff =
                    now.unix_timestamp() - d.document_type.retention().whole_seconds();
                d.import_timestamp >= cutoff
            })
            .cloned()
            .collect();
        let evicted = documents.len() - kept.len();
        if evicted > 0 {
            tracing::debug!(evicted, "swept expired documents");
            self.store.persist(keys::DOCUMENTS, &kept).await?;
        }
        Ok(evicted)
    }
}
