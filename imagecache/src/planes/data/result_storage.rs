use super::items;
use crate::context::StorageContext;
use crate::domain::response::{
    CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, PutResponse, RemoveResponse, ResultEntry,
};
use crate::domain::{KeyField, LastUpdated, RequestContext};
use crate::guard::ErrorPolicy;
use crate::planes::control::{IndexOutcome, OrphanSweeper, ensure_index};
use crate::ports::{BlobStore, DocumentStore, StorageFactory};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use shared::config::ResultStorageConfig;
use shared::{Result, TtlSecs};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rendered output storage keyed by the request url
pub struct ResultStorage {
    config: ResultStorageConfig,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    context: Arc<StorageContext>,
    policy: ErrorPolicy,
}

impl ResultStorage {
    const NAME: &str = "MONGODB_RESULT_STORAGE";

    pub fn new(
        config: ResultStorageConfig,
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

    pub async fn open(
        config: ResultStorageConfig,
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
        config: ResultStorageConfig,
        factory: &dyn StorageFactory,
        context: Arc<StorageContext>,
    ) -> Result<Self> {
        let backends = factory.backends(&config.mongo, KeyField::Key).await?;
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
            &KeyField::Key.lookup_index(),
            self.config.ignore_errors,
        )
        .await
    }

    fn is_auto_webp(&self, request: &RequestContext) -> bool {
        self.config.auto_webp && request.accepts_webp
    }

    /// Storage key for the request, with a `/webp` suffix when webp is negotiated
    pub fn key_for(&self, request: &RequestContext) -> String {
        let mut key = format!("result:{}", request.url);
        if self.is_auto_webp(request) {
            key.push_str("/webp");
        }
        key
    }

    fn max_age(&self, request: &RequestContext) -> TtlSecs {
        if request.max_age == Some(0) {
            return TtlSecs(0);
        }
        self.config.expiration
    }

    /// Store the rendered bytes. `headers` are kept only when metadata capture is on.
    pub async fn put(
        &self,
        request: &RequestContext,
        bytes: Bytes,
        headers: &HashMap<String, String>,
    ) -> Result<Option<PutResponse>> {
        let key = self.key_for(request);
        let metadata = if self.config.stores_metadata {
            headers.clone()
        } else {
            HashMap::new()
        };

        let result = items::write_item(
            self.documents.as_ref(),
            self.blobs.as_ref(),
            KeyField::Key,
            &key,
            self.context.now(),
            bytes,
            |doc| doc.metadata = Some(metadata),
        )
        .await;

        self.policy.settle("put", result.map(Some), || None)
    }

    pub async fn get(&self, request: &RequestContext) -> Result<Option<ResultEntry>> {
        let result = self.try_get(request).await;
        self.policy.settle("get", result, || None)
    }

    async fn try_get(&self, request: &RequestContext) -> Result<Option<ResultEntry>> {
        let key = self.key_for(request);
        let Some(query) = items::fresh_query(&key, self.max_age(request), self.context.now())
        else {
            return Ok(None);
        };

        let Some(doc) = self.documents.find_latest(&query).await? else {
            debug!("[{}] miss for '{}'", Self::NAME, key);
            return Ok(None);
        };
        let Some(bytes) = items::read_blob(self.blobs.as_ref(), &doc).await? else {
            return Ok(None);
        };

        let content_type = self.context.content_type(&bytes).to_string();
        let mut metadata = doc.metadata.unwrap_or_default();
        metadata.insert(LAST_MODIFIED.to_string(), http_date(doc.created_at));
        metadata.insert(CONTENT_LENGTH.to_string(), bytes.len().to_string());
        metadata.insert(CONTENT_TYPE.to_string(), content_type.clone());

        Ok(Some(ResultEntry {
            last_modified: doc.created_at,
            content_length: bytes.len(),
            content_type,
            metadata,
            bytes,
        }))
    }

    pub async fn exists(&self, request: &RequestContext) -> Result<bool> {
        let key = self.key_for(request);
        let result = match items::fresh_query(&key, self.max_age(request), self.context.now()) {
            Some(query) => self
                .documents
                .count(&query, Some(1))
                .await
                .map(|count| count >= 1),
            None => Ok(false),
        };

        self.policy.settle("exists", result, || false)
    }

    /// When the cached result was produced.
    ///
    /// With expiration off this is the storage start time. A missing document
    /// yields [`LastUpdated::Degraded`] carrying the current time.
    pub async fn last_updated(&self, request: &RequestContext) -> Result<LastUpdated> {
        let max_age = self.max_age(request);
        if max_age.is_zero() {
            return Ok(LastUpdated::Unbounded(self.context.start_time()));
        }

        let now = self.context.now();
        let result = self.try_last_updated(request, max_age, now).await;
        self.policy
            .settle("last_updated", result, || LastUpdated::Degraded(now))
    }

    async fn try_last_updated(
        &self,
        request: &RequestContext,
        max_age: TtlSecs,
        now: DateTime<Utc>,
    ) -> Result<LastUpdated> {
        let key = self.key_for(request);
        let doc = match items::fresh_query(&key, max_age, now) {
            Some(query) => self.documents.find_latest(&query).await?,
            None => None,
        };

        let Some(doc) = doc else {
            warn!(
                "[{}] last_updated for '{}' found no document; the put failed or the item is gone",
                Self::NAME,
                key
            );
            return Ok(LastUpdated::Degraded(now));
        };

        let age = (now - doc.created_at).num_seconds().max(0);
        let ttl = i64::try_from(max_age.0).unwrap_or(i64::MAX);
        if ttl - age < 0 {
            return Ok(LastUpdated::Degraded(now));
        }
        Ok(LastUpdated::Stored(now - Duration::seconds(age)))
    }

    pub async fn remove(&self, request: &RequestContext) -> Result<Option<RemoveResponse>> {
        let key = self.key_for(request);
        let result = items::remove_item(self.documents.as_ref(), self.blobs.as_ref(), &key).await;
        self.policy.settle("remove", result.map(Some), || None)
    }
}

/// RFC 7231 date, e.g. `Tue, 14 Nov 2023 22:13:20 GMT`
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl Debug for ResultStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStorage")
            .field("collection", &self.config.mongo.collection)
            .field("expiration", &self.config.expiration)
            .field("auto_webp", &self.config.auto_webp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ManualClock;
    use crate::persistence::{MemoryBlobStore, MemoryDocumentStore};
    use crate::ports::Clock;
    use chrono::TimeZone;
    use shared::Error;
    use shared::config::{Endpoint, MongoSettings};

    const JPEG: &[u8] = b"\xFF\xD8\xFF\xE0\x00\x10JFIF\x00rest-of-image";

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn config(expiration: u64) -> ResultStorageConfig {
        ResultStorageConfig {
            mongo: MongoSettings {
                endpoint: Endpoint::Uri("mongodb://localhost:27017".to_string()),
                database: "thumbor".to_string(),
                collection: "results".to_string(),
            },
            expiration: TtlSecs(expiration),
            stores_metadata: false,
            auto_webp: false,
            ignore_errors: true,
        }
    }

    struct Fixture {
        storage: ResultStorage,
        documents: Arc<MemoryDocumentStore>,
        blobs: Arc<MemoryBlobStore>,
        clock: Arc<ManualClock>,
    }

    async fn fixture(config: ResultStorageConfig) -> Fixture {
        let documents = Arc::new(MemoryDocumentStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let context = Arc::new(StorageContext::with_clock(clock.clone()));
        let storage = ResultStorage::open(config, documents.clone(), blobs.clone(), context)
            .await
            .unwrap();

        Fixture {
            storage,
            documents,
            blobs,
            clock,
        }
    }

    fn headers() -> HashMap<String, String> {
        HashMap::from([
            ("Cache-Control".to_string(), "max-age=3600".to_string()),
            ("Vary".to_string(), "Accept".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_key_for_request() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/unsafe/300x200/a.jpg").accepting_webp();
        // webp negotiation is off in configuration
        assert_eq!(fx.storage.key_for(&request), "result:/unsafe/300x200/a.jpg");

        let mut cfg = config(60);
        cfg.auto_webp = true;
        let fx = fixture(cfg).await;
        assert_eq!(fx.storage.key_for(&request), "result:/unsafe/300x200/a.jpg/webp");
        assert_eq!(
            fx.storage.key_for(&RequestContext::new("/unsafe/300x200/a.jpg")),
            "result:/unsafe/300x200/a.jpg"
        );
    }

    #[tokio::test]
    async fn test_open_creates_lookup_index() {
        let fx = fixture(config(60)).await;
        assert_eq!(
            fx.documents.index_names().await.unwrap(),
            vec!["key_1_created_at_-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_get_synthesizes_metadata() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/unsafe/a.jpg");
        let invoked_at = fx.clock.now();

        fx.storage
            .put(&request, Bytes::from_static(JPEG), &headers())
            .await
            .unwrap();

        fx.clock.advance(Duration::seconds(1));
        let entry = fx.storage.get(&request).await.unwrap().unwrap();

        assert_eq!(entry.bytes, Bytes::from_static(JPEG));
        assert_eq!(entry.content_length, JPEG.len());
        assert_eq!(entry.content_type, "image/jpeg");
        assert!(entry.last_modified >= invoked_at);
        assert_eq!(entry.metadata[CONTENT_LENGTH], JPEG.len().to_string());
        assert_eq!(entry.metadata[CONTENT_TYPE], "image/jpeg");
        assert_eq!(entry.metadata[LAST_MODIFIED], "Tue, 14 Nov 2023 22:13:20 GMT");
        // capture is off, so only the synthesized fields are present
        assert_eq!(entry.metadata.len(), 3);
    }

    #[tokio::test]
    async fn test_headers_kept_when_metadata_capture_enabled() {
        let mut cfg = config(60);
        cfg.stores_metadata = true;
        let fx = fixture(cfg).await;
        let request = RequestContext::new("/unsafe/a.jpg");

        fx.storage
            .put(&request, Bytes::from_static(JPEG), &headers())
            .await
            .unwrap();

        let entry = fx.storage.get(&request).await.unwrap().unwrap();
        assert_eq!(entry.metadata["Cache-Control"], "max-age=3600");
        assert_eq!(entry.metadata["Vary"], "Accept");
        assert_eq!(entry.metadata.len(), 5);
    }

    #[tokio::test]
    async fn test_result_expires_after_ttl() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/a.jpg");

        fx.storage
            .put(&request, Bytes::from_static(b"IMG"), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(fx.storage.key_for(&request), "result:/a.jpg");

        fx.clock.set(t0() + Duration::seconds(30));
        let entry = fx.storage.get(&request).await.unwrap().unwrap();
        assert_eq!(entry.bytes, Bytes::from_static(b"IMG"));
        assert_eq!(entry.content_type, "application/octet-stream");

        fx.clock.set(t0() + Duration::seconds(61));
        assert!(fx.storage.get(&request).await.unwrap().is_none());
        assert!(!fx.storage.exists(&request).await.unwrap());
    }

    #[tokio::test]
    async fn test_webp_variant_is_stored_separately() {
        let mut cfg = config(60);
        cfg.auto_webp = true;
        let fx = fixture(cfg).await;

        let plain = RequestContext::new("/a.jpg");
        let webp = RequestContext::new("/a.jpg").accepting_webp();

        fx.storage
            .put(&webp, Bytes::from_static(b"RIFF\x00\x00\x00\x00WEBPVP8 "), &HashMap::new())
            .await
            .unwrap();

        assert!(fx.storage.exists(&webp).await.unwrap());
        assert!(!fx.storage.exists(&plain).await.unwrap());
        let entry = fx.storage.get(&webp).await.unwrap().unwrap();
        assert_eq!(entry.content_type, "image/webp");
    }

    #[tokio::test]
    async fn test_last_updated_without_expiration_uses_start_time() {
        let fx = fixture(config(0)).await;
        let request = RequestContext::new("/a.jpg");

        fx.clock.advance(Duration::seconds(500));
        assert_eq!(
            fx.storage.last_updated(&request).await.unwrap(),
            LastUpdated::Unbounded(t0())
        );
    }

    #[tokio::test]
    async fn test_last_updated_from_document_age() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/a.jpg");

        fx.clock.set(t0() + Duration::seconds(100));
        fx.storage
            .put(&request, Bytes::from_static(b"IMG"), &HashMap::new())
            .await
            .unwrap();

        fx.clock.set(t0() + Duration::seconds(125));
        assert_eq!(
            fx.storage.last_updated(&request).await.unwrap(),
            LastUpdated::Stored(t0() + Duration::seconds(100))
        );
    }

    #[tokio::test]
    async fn test_last_updated_without_document_is_degraded() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/never-stored.jpg");

        let last_updated = fx.storage.last_updated(&request).await.unwrap();
        assert!(last_updated.is_degraded());
        assert_eq!(last_updated.timestamp(), t0());
    }

    #[tokio::test]
    async fn test_last_updated_outage() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/a.jpg");
        fx.documents.set_unavailable(true);
        assert!(fx.storage.last_updated(&request).await.unwrap().is_degraded());

        let mut cfg = config(60);
        cfg.ignore_errors = false;
        let strict = fixture(cfg).await;
        strict.documents.set_unavailable(true);
        assert!(matches!(
            strict.storage.last_updated(&request).await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_result() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/a.jpg");
        let put = fx
            .storage
            .put(&request, Bytes::from_static(b"IMG"), &HashMap::new())
            .await
            .unwrap()
            .unwrap();

        let removed = fx.storage.remove(&request).await.unwrap().unwrap();
        assert_eq!(removed, RemoveResponse::new(1, 1));
        assert!(fx.storage.get(&request).await.unwrap().is_none());
        assert!(matches!(
            fx.blobs.get_blob(&put.file_id).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_zero_max_age_override() {
        let fx = fixture(config(60)).await;
        let request = RequestContext::new("/a.jpg");
        fx.storage
            .put(&request, Bytes::from_static(b"IMG"), &HashMap::new())
            .await
            .unwrap();

        let no_cache = RequestContext::new("/a.jpg").with_max_age(0);
        assert!(fx.storage.get(&no_cache).await.unwrap().is_none());
        assert_eq!(
            fx.storage.last_updated(&no_cache).await.unwrap(),
            LastUpdated::Unbounded(t0())
        );
    }
}
