use crate::errors::{is_namespace_not_found, store_error};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, DateTime, Document, doc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use futures::future;
use imagecache::domain::{DocumentQuery, DocumentUpdate, FileId, IndexSpec, KeyField, MetadataDocument};
use imagecache::ports::DocumentStore;
use mongodb::options::IndexOptions;
use mongodb::{Collection, IndexModel};
use shared::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Metadata documents in one MongoDB collection, keyed by `path` or `key`
pub struct MongoDocumentStore {
    collection: Collection<Document>,
    key_field: KeyField,
}

impl MongoDocumentStore {
    pub fn new(collection: Collection<Document>, key_field: KeyField) -> Self {
        Self {
            collection,
            key_field,
        }
    }

    fn key_filter(&self, key: &str) -> Document {
        let mut filter = Document::new();
        filter.insert(self.key_field.as_str(), key);
        filter
    }
}

/// Server-side filter equivalent of `DocumentQuery::matches`
pub fn query_filter(query: &DocumentQuery, key_field: KeyField) -> Document {
    let mut filter = Document::new();
    filter.insert(key_field.as_str(), query.key.as_str());
    if let Some(since) = query.created_since {
        filter.insert("created_at", doc! { "$gte": DateTime::from_chrono(since) });
    }
    if query.with_detector_data {
        filter.insert("detector_data", doc! { "$ne": Bson::Null });
    }
    filter
}

pub fn to_document(item: &MetadataDocument, key_field: KeyField) -> Result<Document> {
    let file_id = ObjectId::parse_str(item.file_id.as_str())
        .map_err(|e| Error::Internal(format!("Invalid file id '{}': {}", item.file_id, e)))?;

    let mut out = Document::new();
    out.insert(key_field.as_str(), item.key.as_str());
    out.insert("created_at", DateTime::from_chrono(item.created_at));
    out.insert("file_id", file_id);
    if let Some(crypto) = &item.crypto {
        out.insert("crypto", crypto.as_str());
    }
    if let Some(data) = &item.detector_data {
        out.insert("detector_data", json_to_bson(data)?);
    }
    if let Some(metadata) = &item.metadata {
        let headers: Document = metadata
            .iter()
            .map(|(name, value)| (name.clone(), Bson::String(value.clone())))
            .collect();
        out.insert("metadata", headers);
    }
    Ok(out)
}

pub fn from_document(raw: Document, key_field: KeyField) -> Result<MetadataDocument> {
    let key = raw
        .get_str(key_field.as_str())
        .map_err(|e| Error::Internal(format!("Document without '{}': {}", key_field.as_str(), e)))?
        .to_string();
    let created_at = raw
        .get_datetime("created_at")
        .map_err(|e| Error::Internal(format!("Document without 'created_at': {}", e)))?
        .to_chrono();
    let file_id = match raw.get("file_id") {
        Some(Bson::ObjectId(oid)) => FileId::new(oid.to_hex()),
        Some(Bson::String(id)) => FileId::new(id.as_str()),
        other => {
            return Err(Error::Internal(format!(
                "Document for '{}' has unusable file_id: {:?}",
                key, other
            )));
        }
    };

    let mut item = MetadataDocument::new(key, created_at, file_id);
    item.crypto = raw.get_str("crypto").ok().map(str::to_string);
    item.detector_data = raw
        .get("detector_data")
        .filter(|data| !matches!(data, Bson::Null))
        .map(|data| data.clone().into_relaxed_extjson());
    item.metadata = raw.get_document("metadata").ok().map(|headers| {
        headers
            .iter()
            .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
            .collect::<HashMap<_, _>>()
    });
    Ok(item)
}

fn json_to_bson(value: &serde_json::Value) -> Result<Bson> {
    bson::to_bson(value).map_err(|e| Error::Internal(format!("Failed to encode detector data: {}", e)))
}

fn update_document(update: &DocumentUpdate) -> Result<Document> {
    let set = match update {
        DocumentUpdate::Crypto(crypto) => doc! { "crypto": crypto.as_str() },
        DocumentUpdate::DetectorData(data) => {
            let data = json_to_bson(data)?;
            doc! { "detector_data": data }
        }
    };
    Ok(doc! { "$set": set })
}

fn index_model(index: &IndexSpec) -> IndexModel {
    let keys: Document = index
        .fields
        .iter()
        .map(|(field, direction)| (field.clone(), Bson::Int32(direction.as_i32())))
        .collect();
    let options = IndexOptions::builder().name(index.name.clone()).build();
    IndexModel::builder().keys(keys).options(options).build()
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn index_names(&self) -> Result<Vec<String>> {
        match self.collection.list_index_names().await {
            Ok(names) => Ok(names),
            Err(err) if is_namespace_not_found(&err) => Ok(Vec::new()),
            Err(err) => Err(store_error("list indexes")(err)),
        }
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<()> {
        self.collection
            .create_index(index_model(index))
            .await
            .map_err(store_error("create index"))?;
        debug!("Created index {} on {}", index.name, self.collection.name());
        Ok(())
    }

    async fn insert(&self, doc: MetadataDocument) -> Result<()> {
        let raw = to_document(&doc, self.key_field)?;
        self.collection
            .insert_one(raw)
            .await
            .map_err(store_error("insert document"))?;
        Ok(())
    }

    async fn find_latest(&self, query: &DocumentQuery) -> Result<Option<MetadataDocument>> {
        let found = self
            .collection
            .find_one(query_filter(query, self.key_field))
            .sort(doc! { "created_at": -1 })
            .await
            .map_err(store_error("find document"))?;

        found.map(|raw| from_document(raw, self.key_field)).transpose()
    }

    async fn count(&self, query: &DocumentQuery, limit: Option<u64>) -> Result<u64> {
        let mut action = self.collection.count_documents(query_filter(query, self.key_field));
        if let Some(limit) = limit {
            action = action.limit(limit);
        }
        action.await.map_err(store_error("count documents"))
    }

    async fn update(&self, key: &str, update: DocumentUpdate) -> Result<u64> {
        let result = self
            .collection
            .update_many(self.key_filter(key), update_document(&update)?)
            .await
            .map_err(store_error("update documents"))?;
        Ok(result.matched_count)
    }

    async fn delete_all(&self, key: &str) -> Result<Vec<FileId>> {
        let filter = self.key_filter(key);
        let referenced: Vec<Document> = self
            .collection
            .find(filter.clone())
            .projection(doc! { "file_id": 1 })
            .await
            .map_err(store_error("find documents"))?
            .try_collect()
            .await
            .map_err(store_error("read documents"))?;

        self.collection
            .delete_many(filter)
            .await
            .map_err(store_error("delete documents"))?;

        Ok(referenced
            .iter()
            .filter_map(|raw| match raw.get("file_id") {
                Some(Bson::ObjectId(oid)) => Some(FileId::new(oid.to_hex())),
                Some(Bson::String(id)) => Some(FileId::new(id.as_str())),
                _ => None,
            })
            .collect())
    }

    fn scan(&self) -> BoxStream<'_, Result<MetadataDocument>> {
        let key_field = self.key_field;
        stream::once(async move { self.collection.find(doc! {}).await })
            .try_flatten()
            .map_err(store_error("scan documents"))
            .try_filter_map(move |raw| {
                future::ready(Ok(match from_document(raw, key_field) {
                    Ok(item) => Some(item),
                    Err(err) => {
                        warn!("Skipping unreadable document: {}", err);
                        None
                    }
                }))
            })
            .boxed()
    }

    async fn delete_by_file_id(&self, file_id: &FileId) -> Result<u64> {
        let filter = match ObjectId::parse_str(file_id.as_str()) {
            Ok(oid) => doc! { "file_id": oid },
            Err(_) => doc! { "file_id": file_id.as_str() },
        };
        let result = self
            .collection
            .delete_many(filter)
            .await
            .map_err(store_error("delete documents"))?;
        Ok(result.deleted_count)
    }
}
