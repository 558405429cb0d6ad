use crate::domain::FileId;
use crate::ports::{BlobStore, Clock, DocumentStore};
use chrono::Duration;
use futures::TryStreamExt;
use shared::Result;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOOKUP_BATCH: usize = 256;

#[derive(Clone, Debug)]
pub struct SweepOptions {
    /// Items younger than this are left alone, so in-flight puts are not mistaken for orphans
    pub grace: Duration,
    pub dry_run: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            grace: Duration::hours(1),
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub documents_scanned: usize,
    pub blobs_scanned: usize,
    /// Blobs no document points at
    pub orphan_blobs: Vec<FileId>,
    /// File ids of documents whose blob is gone
    pub orphan_documents: Vec<FileId>,
    pub blobs_removed: u64,
    pub documents_removed: u64,
}

/// Reconciles a collection with its blob store after interrupted writes.
/// Not needed for correctness of reads; run it from a maintenance job.
pub struct OrphanSweeper {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl OrphanSweeper {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            documents,
            blobs,
            clock,
        }
    }

    pub async fn sweep(&self, options: &SweepOptions) -> Result<SweepReport> {
        let cutoff = self.clock.now() - options.grace;
        let mut report = SweepReport::default();

        // file ids seen on any document; needed to judge blobs
        let mut referenced: HashSet<FileId> = HashSet::new();
        let mut candidates: Vec<FileId> = Vec::new();
        let mut orphan_documents: BTreeSet<FileId> = BTreeSet::new();

        let mut documents = self.documents.scan();
        while let Some(doc) = documents.try_next().await? {
            report.documents_scanned += 1;
            if doc.created_at < cutoff && !referenced.contains(&doc.file_id) {
                candidates.push(doc.file_id.clone());
            }
            referenced.insert(doc.file_id);

            if candidates.len() >= LOOKUP_BATCH {
                self.collect_missing(&mut candidates, &mut orphan_documents)
                    .await?;
            }
        }
        drop(documents);
        self.collect_missing(&mut candidates, &mut orphan_documents)
            .await?;

        let mut blobs = self.blobs.list();
        while let Some(blob) = blobs.try_next().await? {
            report.blobs_scanned += 1;
            if blob.uploaded_at < cutoff && !referenced.contains(&blob.file_id) {
                report.orphan_blobs.push(blob.file_id);
            }
        }
        drop(blobs);

        report.orphan_documents = orphan_documents.into_iter().collect();

        if options.dry_run {
            info!(
                "Dry run: {} orphan blob(s), {} orphan document reference(s)",
                report.orphan_blobs.len(),
                report.orphan_documents.len()
            );
            return Ok(report);
        }

        for file_id in &report.orphan_blobs {
            match self.blobs.delete_blob(file_id).await {
                Ok(true) => report.blobs_removed += 1,
                Ok(false) => debug!("Orphan blob {} already gone", file_id),
                Err(err) => warn!("Failed to delete orphan blob {}: {}", file_id, err),
            }
        }

        for file_id in &report.orphan_documents {
            match self.documents.delete_by_file_id(file_id).await {
                Ok(removed) => report.documents_removed += removed,
                Err(err) => warn!("Failed to delete documents for blob {}: {}", file_id, err),
            }
        }

        info!(
            "Sweep removed {} blob(s) and {} document(s) after scanning {} document(s) and {} blob(s)",
            report.blobs_removed,
            report.documents_removed,
            report.documents_scanned,
            report.blobs_scanned
        );
        Ok(report)
    }

    /// Move the candidates whose blob is not stored into `missing`.
    /// Blobs are looked up by id, so blobs outside this store's listing still count.
    async fn collect_missing(
        &self,
        candidates: &mut Vec<FileId>,
        missing: &mut BTreeSet<FileId>,
    ) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let present = self.blobs.existing(candidates.as_slice()).await?;
        missing.extend(candidates.drain(..).filter(|file_id| !present.contains(file_id)));
        Ok(())
    }
}
