use crate::domain::response::{PutResponse, RemoveResponse};
use crate::domain::{BlobAttributes, DocumentQuery, KeyField, MetadataDocument};
use crate::ports::{BlobStore, DocumentStore};
use bytes::Bytes;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use shared::{Error, Result, TtlSecs};
use tracing::{debug, warn};

/// Query for documents of `key` still inside the TTL window.
/// `None` when the TTL is zero, meaning nothing can be fresh.
pub(super) fn fresh_query(key: &str, ttl: TtlSecs, now: DateTime<Utc>) -> Option<DocumentQuery> {
    if ttl.is_zero() {
        return None;
    }

    let query = DocumentQuery::for_key(key);
    let since = i64::try_from(ttl.0)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|window| now.checked_sub_signed(window));

    // A window wider than chrono can represent has no lower bound
    Some(match since {
        Some(since) => query.created_since(since),
        None => query,
    })
}

/// Write the blob, then the document pointing at it.
/// If the document write fails the blob is deleted again, best effort.
/// `created_at` is kept to millisecond precision, the resolution of BSON dates.
pub(super) async fn write_item(
    documents: &dyn DocumentStore,
    blobs: &dyn BlobStore,
    key_field: KeyField,
    key: &str,
    created_at: DateTime<Utc>,
    bytes: Bytes,
    decorate: impl FnOnce(&mut MetadataDocument),
) -> Result<PutResponse> {
    let created_at = created_at.trunc_subsecs(3);
    let attributes = BlobAttributes {
        key_field,
        key: key.to_string(),
        created_at,
    };
    let size = bytes.len();
    let file_id = blobs.put_blob(bytes, &attributes).await?;

    let mut doc = MetadataDocument::new(key, created_at, file_id.clone());
    decorate(&mut doc);

    if let Err(err) = documents.insert(doc).await {
        match blobs.delete_blob(&file_id).await {
            Ok(_) => debug!("Rolled back blob {} for '{}'", file_id, key),
            Err(cleanup) => warn!(
                "Blob {} for '{}' left without a document: {}",
                file_id, key, cleanup
            ),
        }
        return Err(err);
    }

    debug!("Stored {} bytes for '{}' as {}", size, key, file_id);
    Ok(PutResponse::new(key, file_id, created_at))
}

/// Blob bytes of `doc`; a missing blob reads as a miss
pub(super) async fn read_blob(blobs: &dyn BlobStore, doc: &MetadataDocument) -> Result<Option<Bytes>> {
    match blobs.get_blob(&doc.file_id).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(Error::NotFound) => {
            warn!(
                "Document for '{}' references missing blob {}",
                doc.key, doc.file_id
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Delete all documents of `key`, their blobs, and blobs filed under `key` with no document
pub(super) async fn remove_item(
    documents: &dyn DocumentStore,
    blobs: &dyn BlobStore,
    key: &str,
) -> Result<RemoveResponse> {
    let file_ids = documents.delete_all(key).await?;
    let mut blobs_removed = 0u64;

    for file_id in &file_ids {
        if blobs.delete_blob(file_id).await? {
            blobs_removed += 1;
        }
    }

    for file_id in blobs.find_by_key(key).await? {
        if blobs.delete_blob(&file_id).await? {
            debug!("Removed orphan blob {} for '{}'", file_id, key);
            blobs_removed += 1;
        }
    }

    Ok(RemoveResponse::new(file_ids.len() as u64, blobs_removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryBlobStore, MemoryDocumentStore};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_query_window() {
        let query = fresh_query("/a.jpg", TtlSecs(60), at(100)).unwrap();
        assert_eq!(query.created_since, Some(at(40)));
        assert!(fresh_query("/a.jpg", TtlSecs(0), at(100)).is_none());
    }

    #[test]
    fn test_fresh_query_huge_ttl_has_no_bound() {
        let query = fresh_query("/a.jpg", TtlSecs(u64::MAX), at(0)).unwrap();
        assert_eq!(query.created_since, None);
    }

    #[tokio::test]
    async fn test_failed_document_write_rolls_back_blob() {
        let documents = MemoryDocumentStore::new();
        let blobs = MemoryBlobStore::new();
        documents.set_unavailable(true);

        let result = write_item(
            &documents,
            &blobs,
            KeyField::Path,
            "/a.jpg",
            at(0),
            Bytes::from_static(b"IMG"),
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_remove_item_cleans_orphan_blobs() {
        let documents = MemoryDocumentStore::new();
        let blobs = MemoryBlobStore::new();

        write_item(
            &documents,
            &blobs,
            KeyField::Path,
            "/a.jpg",
            at(0),
            Bytes::from_static(b"IMG"),
            |_| {},
        )
        .await
        .unwrap();

        // blob written by a put that crashed before its document
        blobs
            .put_blob(
                Bytes::from_static(b"LOST"),
                &BlobAttributes {
                    key_field: KeyField::Path,
                    key: "/a.jpg".to_string(),
                    created_at: at(1),
                },
            )
            .await
            .unwrap();

        let removed = remove_item(&documents, &blobs, "/a.jpg").await.unwrap();
        assert_eq!(removed, RemoveResponse::new(1, 2));
        assert!(documents.is_empty());
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_write_item_keeps_millisecond_precision() {
        let documents = MemoryDocumentStore::new();
        let blobs = MemoryBlobStore::new();
        let requested = at(0) + Duration::nanoseconds(123_456_789);

        let put = write_item(
            &documents,
            &blobs,
            KeyField::Path,
            "/a.jpg",
            requested,
            Bytes::from_static(b"IMG"),
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(put.created_at, at(0) + Duration::milliseconds(123));
        let stored = documents
            .find_latest(&DocumentQuery::for_key("/a.jpg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.created_at, put.created_at);
    }
}
