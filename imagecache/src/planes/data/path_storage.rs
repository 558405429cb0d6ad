use super::items;
use crate::context::StorageContext;
use crate::domain::response::{PutResponse, RemoveResponse};
use crate::domain::{DocumentQuery, DocumentUpdate, KeyField, RequestContext};
use crate::guard::ErrorPolicy;
use crate::planes::control::{IndexOutcome, OrphanSweeper, ensure_index};
use crate::ports::{BlobStore, DocumentStore, StorageFactory};
use bytes::Bytes;
use serde_json::Value;
use shared::config::PathStorageConfig;
use shared::{Error, Result, TtlSecs};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Source image storage keyed by normalized request path.
///
/// Every item is a metadata document plus a blob. Reads only see the newest
/// document inside the expiration window; older ones stay until removed.
pub struct PathStorage {
    config: PathStorageConfig,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    context: Arc<StorageContext>,
    policy: ErrorPolicy,
}

impl PathStorage {
    const NAME: &str = "MONGODB_STORAGE";

    pub fn new(
        config: PathStorageConfig,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        context: Arc<StorageContext>,
    ) -> Self {
        let policy = ErrorPolicy::new(Self::NAME, config.ignore_errors);
        Self {
            config,
            documents,
            blobs,
            context,
            policy,
        }
    }

    /// Build the storage and make sure its lookup index exists
    pub async fn open(
        config: PathStorageConfig,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        context: Arc<StorageContext>,
    ) -> Result<Self> {
        let storage = Self::new(config, documents, blobs, context);
        storage.ensure_indexes().await?;
        Ok(storage)
    }

    /// Resolve the backends for `config` through `factory`, then `open`
    pub async fn connect(
        config: PathStorageConfig,
        factory: &dyn StorageFactory,
        context: Arc<StorageContext>,
    ) -> Result<Self> {
        let backends = factory.backends(&config.mongo, KeyField::Path).await?;
        Self::open(config, backends.documents, backends.blobs, context).await
    }

    /// Maintenance sweeper over this storage's collection and blobs
    pub fn sweeper(&self) -> OrphanSweeper {
        OrphanSweeper::new(
            Arc::clone(&self.documents),
            Arc::clone(&self.blobs),
            self.context.clock(),
        )
    }

    pub async fn ensure_indexes(&self) -> Result<IndexOutcome> {
        ensure_index(
            self.documents.as_ref(),
            &KeyField::Path.lookup_index(),
            self.config.ignore_errors,
        )
        .await
    }

    /// TTL for this request; a max-age override of zero expires everything
    fn max_age(&self, request: &RequestContext) -> TtlSecs {
        if request.max_age == Some(0) {
            return TtlSecs(0);
        }
        self.config.expiration
    }

    /// The key to stamp on items, or `None` when stamping is off
    fn signing_key(&self) -> Result<Option<&str>> {
        if !self.config.stores_crypto_key_for_each_image {
            return Ok(None);
        }

        match self.config.security_key.as_deref() {
            Some(key) => Ok(Some(key)),
            None => Err(Error::Configuration(
                "STORES_CRYPTO_KEY_FOR_EACH_IMAGE can't be True if no SECURITY_KEY specified"
                    .to_string(),
            )),
        }
    }

    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<Option<PutResponse>> {
        let crypto = self.signing_key()?.map(str::to_string);
        let created_at = self.context.now();

        let result = items::write_item(
            self.documents.as_ref(),
            self.blobs.as_ref(),
            KeyField::Path,
            path,
            created_at,
            bytes,
            |doc| doc.crypto = crypto,
        )
        .await;

        self.policy.settle("put", result.map(Some), || None)
    }

    /// Stamp the server signing key on the stored item.
    /// Returns `None` when per-image keys are disabled.
    pub async fn put_crypto(&self, path: &str) -> Result<Option<String>> {
        let Some(key) = self.signing_key()? else {
            return Ok(None);
        };

        let result = self
            .documents
            .update(path, DocumentUpdate::Crypto(key.to_string()))
            .await
            .map(|matched| {
                debug!("Stamped crypto key on {} document(s) for '{}'", matched, path);
                Some(path.to_string())
            });

        self.policy.settle("put_crypto", result, || None)
    }

    pub async fn put_detector_data(&self, path: &str, data: Value) -> Result<Option<String>> {
        let result = self
            .documents
            .update(path, DocumentUpdate::DetectorData(data))
            .await
            .map(|matched| {
                debug!("Stored detector data on {} document(s) for '{}'", matched, path);
                Some(path.to_string())
            });

        self.policy.settle("put_detector_data", result, || None)
    }

    pub async fn get_crypto(&self, path: &str) -> Result<Option<String>> {
        let result = self
            .documents
            .find_latest(&DocumentQuery::for_key(path))
            .await
            .map(|doc| doc.and_then(|doc| doc.crypto));

        self.policy.settle("get_crypto", result, || None)
    }

    pub async fn get_detector_data(&self, path: &str) -> Result<Option<Value>> {
        let result = self
            .documents
            .find_latest(&DocumentQuery::for_key(path).with_detector_data())
            .await
            .map(|doc| doc.and_then(|doc| doc.detector_data));

        self.policy.settle("get_detector_data", result, || None)
    }

    pub async fn get(&self, path: &str, request: &RequestContext) -> Result<Option<Bytes>> {
        let result = self.try_get(path, request).await;
        self.policy.settle("get", result, || None)
    }

    async fn try_get(&self, path: &str, request: &RequestContext) -> Result<Option<Bytes>> {
        let Some(query) = items::fresh_query(path, self.max_age(request), self.context.now())
        else {
            return Ok(None);
        };

        match self.documents.find_latest(&query).await? {
            Some(doc) => items::read_blob(self.blobs.as_ref(), &doc).await,
            None => {
                debug!("[{}] miss for '{}'", Self::NAME, path);
                Ok(None)
            }
        }
    }

    pub async fn exists(&self, path: &str, request: &RequestContext) -> Result<bool> {
        let result = match items::fresh_query(path, self.max_age(request), self.context.now()) {
            Some(query) => self
                .documents
                .count(&query, Some(1))
                .await
                .map(|count| count >= 1),
            None => Ok(false),
        };

        self.policy.settle("exists", result, || false)
    }

    pub async fn remove(&self, path: &str) -> Result<Option<RemoveResponse>> {
        let result = items::remove_item(self.documents.as_ref(), self.blobs.as_ref(), path).await;
        self.policy.settle("remove", result.map(Some), || None)
    }
}

impl Debug for PathStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathStorage")
            .field("collection", &self.config.mongo.collection)
            .field("expiration", &self.config.expiration)
            .finish()
    }
}
