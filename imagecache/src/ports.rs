#![deny(clippy::all)]

use crate::domain::{
    BlobAttributes, BlobInfo, DocumentQuery, DocumentUpdate, FileId, IndexSpec, KeyField,
    MetadataDocument,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use shared::Result;
use shared::config::MongoSettings;
use std::collections::HashSet;
use std::sync::Arc;

// Ports are the pluggable extension points for the underlying database and blob store

/// The pair of stores backing one storage
#[derive(Clone)]
pub struct Backends {
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Port for building backends from connection settings.
/// Repeated calls with the same settings share one connection.
#[async_trait]
pub trait StorageFactory: Send + Sync + 'static {
    async fn backends(&self, settings: &MongoSettings, key_field: KeyField) -> Result<Backends>;
}

/// Port for the collection holding metadata documents
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Names of the indexes currently defined on the collection
    async fn index_names(&self) -> Result<Vec<String>>;

    async fn create_index(&self, index: &IndexSpec) -> Result<()>;

    async fn insert(&self, doc: MetadataDocument) -> Result<()>;

    /// Newest matching document by `created_at`
    async fn find_latest(&self, query: &DocumentQuery) -> Result<Option<MetadataDocument>>;

    /// Count matching documents, stopping at `limit` when given
    async fn count(&self, query: &DocumentQuery, limit: Option<u64>) -> Result<u64>;

    /// Apply the update to every document of `key`, returning how many matched
    async fn update(&self, key: &str, update: DocumentUpdate) -> Result<u64>;

    /// Delete every document of `key` and return the file ids they referenced
    async fn delete_all(&self, key: &str) -> Result<Vec<FileId>>;

    /// Every document in the collection, streamed; used by maintenance jobs only
    fn scan(&self) -> BoxStream<'_, Result<MetadataDocument>>;

    async fn delete_by_file_id(&self, file_id: &FileId) -> Result<u64>;
}

/// Port for the large-object store holding payload bytes
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put_blob(&self, bytes: Bytes, attributes: &BlobAttributes) -> Result<FileId>;

    /// Fails with `Error::NotFound` when the id is malformed or nothing is stored under it
    async fn get_blob(&self, file_id: &FileId) -> Result<Bytes>;

    /// Returns whether a blob was actually deleted
    async fn delete_blob(&self, file_id: &FileId) -> Result<bool>;

    /// Blobs whose attributes carry `key`, with or without a document
    async fn find_by_key(&self, attributes_key: &str) -> Result<Vec<FileId>>;

    /// The subset of `file_ids` that name a stored blob, whatever attributes it carries
    async fn existing(&self, file_ids: &[FileId]) -> Result<HashSet<FileId>>;

    /// Blobs carrying this store's key field, streamed
    fn list(&self) -> BoxStream<'_, Result<BlobInfo>>;
}

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Guesses a MIME type from payload bytes
pub trait ContentTypeSniffer: Send + Sync + 'static {
    fn sniff(&self, bytes: &[u8]) -> Option<&'static str>;
}
