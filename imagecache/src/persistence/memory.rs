use crate::domain::{
    BlobAttributes, BlobInfo, DocumentQuery, DocumentUpdate, FileId, IndexSpec, KeyField,
    MetadataDocument,
};
use crate::ports::{Backends, BlobStore, DocumentStore, StorageFactory};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use shared::config::MongoSettings;
use shared::{Error, Result};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// In-process document collection.
/// Behaves like the MongoDB collection for everything the storages rely on.
#[derive(Default)]
pub struct MemoryDocumentStore {
    // key -> every document stored under it, in insertion order
    documents: DashMap<String, Vec<MetadataDocument>>,
    // index name -> definition
    indexes: DashMap<String, IndexSpec>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreUnavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of documents across all keys
    pub fn len(&self) -> usize {
        self.documents.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory document store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn index_names(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<()> {
        self.check_available()?;
        if let Some(existing) = self.indexes.get(&index.name) {
            if existing.fields != index.fields {
                return Err(Error::Internal(format!(
                    "Index {} already exists with different keys",
                    index.name
                )));
            }
            return Ok(());
        }
        self.indexes.insert(index.name.clone(), index.clone());
        Ok(())
    }

    async fn insert(&self, doc: MetadataDocument) -> Result<()> {
        self.check_available()?;
        self.documents.entry(doc.key.clone()).or_default().push(doc);
        Ok(())
    }

    async fn find_latest(&self, query: &DocumentQuery) -> Result<Option<MetadataDocument>> {
        self.check_available()?;
        let Some(docs) = self.documents.get(&query.key) else {
            return Ok(None);
        };

        Ok(docs
            .iter()
            .filter(|doc| query.matches(doc))
            .max_by_key(|doc| doc.created_at)
            .cloned())
    }

    async fn count(&self, query: &DocumentQuery, limit: Option<u64>) -> Result<u64> {
        self.check_available()?;
        let matched = self
            .documents
            .get(&query.key)
            .map(|docs| docs.iter().filter(|doc| query.matches(doc)).count() as u64)
            .unwrap_or(0);

        Ok(match limit {
            Some(limit) => matched.min(limit),
            None => matched,
        })
    }

    async fn update(&self, key: &str, update: DocumentUpdate) -> Result<u64> {
        self.check_available()?;
        let Some(mut docs) = self.documents.get_mut(key) else {
            return Ok(0);
        };

        for doc in docs.iter_mut() {
            match &update {
                DocumentUpdate::Crypto(crypto) => doc.crypto = Some(crypto.clone()),
                DocumentUpdate::DetectorData(data) => doc.detector_data = Some(data.clone()),
            }
        }
        Ok(docs.len() as u64)
    }

    async fn delete_all(&self, key: &str) -> Result<Vec<FileId>> {
        self.check_available()?;
        Ok(self
            .documents
            .remove(key)
            .map(|(_, docs)| docs.into_iter().map(|doc| doc.file_id).collect())
            .unwrap_or_default())
    }

    fn scan(&self) -> BoxStream<'_, Result<MetadataDocument>> {
        if let Err(err) = self.check_available() {
            return stream::iter([Err(err)]).boxed();
        }
        let docs: Vec<Result<MetadataDocument>> = self
            .documents
            .iter()
            .flat_map(|entry| entry.value().clone())
            .map(Ok)
            .collect();
        stream::iter(docs).boxed()
    }

    async fn delete_by_file_id(&self, file_id: &FileId) -> Result<u64> {
        self.check_available()?;
        let mut removed = 0u64;
        for mut entry in self.documents.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|doc| &doc.file_id != file_id);
            removed += (before - entry.value().len()) as u64;
        }
        self.documents.retain(|_, docs| !docs.is_empty());
        Ok(removed)
    }
}

impl Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentStore")
            .field("keys", &self.documents.len())
            .field("indexes", &self.indexes.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
struct StoredBlob {
    bytes: Bytes,
    attributes: BlobAttributes,
}

/// In-process blob store with random identifiers
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<FileId, StoredBlob>,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory blob store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_blob(&self, bytes: Bytes, attributes: &BlobAttributes) -> Result<FileId> {
        self.check_available()?;
        let file_id = FileId::new(Uuid::new_v4().to_string());
        self.blobs.insert(
            file_id.clone(),
            StoredBlob {
                bytes,
                attributes: attributes.clone(),
            },
        );
        Ok(file_id)
    }

    async fn get_blob(&self, file_id: &FileId) -> Result<Bytes> {
        self.check_available()?;
        self.blobs
            .get(file_id)
            .map(|blob| blob.bytes.clone())
            .ok_or(Error::NotFound)
    }

    async fn delete_blob(&self, file_id: &FileId) -> Result<bool> {
        self.check_available()?;
        Ok(self.blobs.remove(file_id).is_some())
    }

    async fn find_by_key(&self, attributes_key: &str) -> Result<Vec<FileId>> {
        self.check_available()?;
        Ok(self
            .blobs
            .iter()
            .filter(|entry| entry.value().attributes.key == attributes_key)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn existing(&self, file_ids: &[FileId]) -> Result<HashSet<FileId>> {
        self.check_available()?;
        Ok(file_ids
            .iter()
            .filter(|file_id| self.blobs.contains_key(*file_id))
            .cloned()
            .collect())
    }

    fn list(&self) -> BoxStream<'_, Result<BlobInfo>> {
        if let Err(err) = self.check_available() {
            return stream::iter([Err(err)]).boxed();
        }
        let blobs: Vec<Result<BlobInfo>> = self
            .blobs
            .iter()
            .map(|entry| {
                Ok(BlobInfo {
                    file_id: entry.key().clone(),
                    key: Some(entry.value().attributes.key.clone()),
                    uploaded_at: entry.value().attributes.created_at,
                })
            })
            .collect();
        stream::iter(blobs).boxed()
    }
}

impl Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

/// Hands out one pair of memory stores per database, collection and key field
#[derive(Default)]
pub struct MemoryStorageFactory {
    stores: DashMap<(String, String, KeyField), (Arc<MemoryDocumentStore>, Arc<MemoryBlobStore>)>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete stores behind `settings`, created on first use
    pub fn stores(
        &self,
        settings: &MongoSettings,
        key_field: KeyField,
    ) -> (Arc<MemoryDocumentStore>, Arc<MemoryBlobStore>) {
        let id = (
            settings.database.clone(),
            settings.collection.clone(),
            key_field,
        );
        self.stores
            .entry(id)
            .or_insert_with(|| {
                (
                    Arc::new(MemoryDocumentStore::new()),
                    Arc::new(MemoryBlobStore::new()),
                )
            })
            .value()
            .clone()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    async fn backends(&self, settings: &MongoSettings, key_field: KeyField) -> Result<Backends> {
        let (documents, blobs) = self.stores(settings, key_field);
        Ok(Backends { documents, blobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KeyField;
    use chrono::{DateTime, TimeZone, Utc};
    use futures::TryStreamExt;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn attributes(key: &str) -> BlobAttributes {
        BlobAttributes {
            key_field: KeyField::Path,
            key: key.to_string(),
            created_at: at(0),
        }
    }

    #[tokio::test]
    async fn test_find_latest_picks_newest_created_at() {
        let store = MemoryDocumentStore::new();
        store
            .insert(MetadataDocument::new("/a.jpg", at(20), FileId::new("new")))
            .await
            .unwrap();
        store
            .insert(MetadataDocument::new("/a.jpg", at(10), FileId::new("old")))
            .await
            .unwrap();

        let latest = store
            .find_latest(&DocumentQuery::for_key("/a.jpg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.file_id, FileId::new("new"));

        let none = store
            .find_latest(&DocumentQuery::for_key("/a.jpg").created_since(at(21)))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_count_respects_limit() {
        let store = MemoryDocumentStore::new();
        for i in 0..3 {
            store
                .insert(MetadataDocument::new("/a.jpg", at(i), FileId::new(format!("f{i}"))))
                .await
                .unwrap();
        }

        let query = DocumentQuery::for_key("/a.jpg");
        assert_eq!(store.count(&query, None).await.unwrap(), 3);
        assert_eq!(store.count(&query, Some(1)).await.unwrap(), 1);
        assert_eq!(store.count(&DocumentQuery::for_key("/b.jpg"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = MemoryDocumentStore::new();
        store
            .insert(MetadataDocument::new("/a.jpg", at(0), FileId::new("f1")))
            .await
            .unwrap();

        let matched = store
            .update("/a.jpg", DocumentUpdate::DetectorData(json!({"faces": 1})))
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(store.update("/missing.jpg", DocumentUpdate::Crypto("k".into())).await.unwrap(), 0);

        let removed = store.delete_all("/a.jpg").await.unwrap();
        assert_eq!(removed, vec![FileId::new("f1")]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_file_id() {
        let store = MemoryDocumentStore::new();
        store
            .insert(MetadataDocument::new("/a.jpg", at(0), FileId::new("f1")))
            .await
            .unwrap();
        store
            .insert(MetadataDocument::new("/a.jpg", at(1), FileId::new("f2")))
            .await
            .unwrap();

        assert_eq!(store.delete_by_file_id(&FileId::new("f1")).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_by_file_id(&FileId::new("f2")).await.unwrap(), 1);
        let remaining: Vec<MetadataDocument> = store.scan().try_collect().await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_create_index_conflict() {
        let store = MemoryDocumentStore::new();
        let index = KeyField::Path.lookup_index();
        store.create_index(&index).await.unwrap();
        store.create_index(&index).await.unwrap();
        assert_eq!(store.index_names().await.unwrap(), vec![index.name.clone()]);

        let mut conflicting = index.clone();
        conflicting.fields.reverse();
        assert!(matches!(
            store.create_index(&conflicting).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_document_store() {
        let store = MemoryDocumentStore::new();
        store.set_unavailable(true);
        let result = store.find_latest(&DocumentQuery::for_key("/a.jpg")).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));

        store.set_unavailable(false);
        assert!(store.find_latest(&DocumentQuery::for_key("/a.jpg")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_round_trip_and_not_found() {
        let blobs = MemoryBlobStore::new();
        let id = blobs
            .put_blob(Bytes::from_static(b"IMG"), &attributes("/a.jpg"))
            .await
            .unwrap();

        assert_eq!(blobs.get_blob(&id).await.unwrap(), Bytes::from_static(b"IMG"));
        assert_eq!(blobs.find_by_key("/a.jpg").await.unwrap(), vec![id.clone()]);

        assert!(blobs.delete_blob(&id).await.unwrap());
        assert!(!blobs.delete_blob(&id).await.unwrap());
        assert!(matches!(blobs.get_blob(&id).await, Err(Error::NotFound)));
        assert!(matches!(
            blobs.get_blob(&FileId::new("not-an-id")).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_existing_reports_only_stored_ids() {
        let blobs = MemoryBlobStore::new();
        let id = blobs
            .put_blob(Bytes::from_static(b"IMG"), &attributes("/a.jpg"))
            .await
            .unwrap();

        let present = blobs
            .existing(&[id.clone(), FileId::new("gone")])
            .await
            .unwrap();
        assert_eq!(present, HashSet::from([id]));

        let listed: Vec<BlobInfo> = blobs.list().try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_factory_shares_stores_per_collection() {
        let factory = MemoryStorageFactory::new();
        let images = MongoSettings {
            endpoint: shared::config::Endpoint::HostPort {
                host: "localhost".to_string(),
                port: 27017,
            },
            database: "thumbor".to_string(),
            collection: "images".to_string(),
        };
        let results = MongoSettings {
            collection: "results".to_string(),
            ..images.clone()
        };

        let first = factory.backends(&images, KeyField::Path).await.unwrap();
        first
            .blobs
            .put_blob(Bytes::from_static(b"IMG"), &attributes("/a.jpg"))
            .await
            .unwrap();

        let again = factory.backends(&images, KeyField::Path).await.unwrap();
        assert_eq!(again.blobs.find_by_key("/a.jpg").await.unwrap().len(), 1);

        let (_, other_blobs) = factory.stores(&results, KeyField::Key);
        assert!(other_blobs.is_empty());
    }
}
