use crate::errors::{io_error, is_file_not_found, store_error};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, DateTime, Document, doc};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use imagecache::domain::{BlobAttributes, BlobInfo, FileId, KeyField};
use imagecache::ports::BlobStore;
use mongodb::Database;
use mongodb::gridfs::{FilesCollectionDocument, GridFsBucket};
use shared::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Payload bytes in the database's default GridFS bucket.
///
/// Both storages share the bucket, so listing and key lookups are scoped by the
/// field the owning storage writes (`metadata.path` or `metadata.key`, or the
/// same name at the top level for older entries). Id lookups are not scoped.
pub struct GridFsBlobStore {
    bucket: GridFsBucket,
    key_field: KeyField,
}

impl GridFsBlobStore {
    pub fn new(database: &Database, key_field: KeyField) -> Self {
        Self {
            bucket: database.gridfs_bucket(None),
            key_field,
        }
    }

    fn owned_by(&self, key: &str) -> Document {
        key_filter(self.key_field, Bson::String(key.to_string()))
    }

    fn owned(&self) -> Document {
        key_filter(self.key_field, Bson::Document(doc! { "$exists": true }))
    }

    async fn files(&self, filter: Document) -> Result<Vec<FilesCollectionDocument>> {
        self.bucket
            .find(filter)
            .await
            .map_err(store_error("query GridFS files"))?
            .try_collect()
            .await
            .map_err(store_error("read GridFS files"))
    }
}

fn metadata_field(key_field: KeyField) -> String {
    format!("metadata.{}", key_field.as_str())
}

/// Match the key field under `metadata`, or at the top level where older
/// writers put the document fields directly on the files entry
fn key_filter(key_field: KeyField, condition: Bson) -> Document {
    let mut nested = Document::new();
    nested.insert(metadata_field(key_field), condition.clone());
    let mut top_level = Document::new();
    top_level.insert(key_field.as_str(), condition);
    doc! { "$or": [nested, top_level] }
}

/// Files entries with any of `file_ids` as `_id`.
/// Hex ids are matched both as ObjectId and as string.
fn ids_filter(file_ids: &[FileId]) -> Document {
    let ids: Vec<Bson> = file_ids
        .iter()
        .flat_map(|file_id| {
            let as_string = Bson::String(file_id.as_str().to_string());
            match object_id(file_id) {
                Some(oid) => vec![oid, as_string],
                None => vec![as_string],
            }
        })
        .collect();
    doc! { "_id": { "$in": ids } }
}

/// Metadata stored on the GridFS file so a blob can be traced without its document
pub fn blob_metadata(attributes: &BlobAttributes) -> Document {
    let mut metadata = Document::new();
    metadata.insert(attributes.key_field.as_str(), attributes.key.as_str());
    metadata.insert("created_at", DateTime::from_chrono(attributes.created_at));
    metadata
}

fn object_id(file_id: &FileId) -> Option<Bson> {
    ObjectId::parse_str(file_id.as_str()).ok().map(Bson::ObjectId)
}

/// The `_id` to address: an ObjectId when the id is hex, else the raw string
fn blob_id(file_id: &FileId) -> Bson {
    object_id(file_id).unwrap_or_else(|| Bson::String(file_id.as_str().to_string()))
}

fn file_id_of(id: &Bson) -> FileId {
    match id {
        Bson::ObjectId(oid) => FileId::new(oid.to_hex()),
        Bson::String(id) => FileId::new(id.as_str()),
        other => FileId::new(other.to_string()),
    }
}

#[async_trait]
impl BlobStore for GridFsBlobStore {
    async fn put_blob(&self, bytes: Bytes, attributes: &BlobAttributes) -> Result<FileId> {
        let oid = ObjectId::new();
        let mut upload = self
            .bucket
            .open_upload_stream(&attributes.key)
            .id(Bson::ObjectId(oid))
            .metadata(blob_metadata(attributes))
            .await
            .map_err(store_error("open GridFS upload"))?;

        let written = match upload.write_all(&bytes).await {
            Ok(()) => upload.close().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Err(abort) = upload.abort().await {
                warn!("Failed to abort GridFS upload {}: {}", oid, abort);
            }
            return Err(io_error("write GridFS blob")(err));
        }

        debug!("Uploaded {} bytes to GridFS as {}", bytes.len(), oid);
        Ok(FileId::new(oid.to_hex()))
    }

    async fn get_blob(&self, file_id: &FileId) -> Result<Bytes> {
        let mut download = match self.bucket.open_download_stream(blob_id(file_id)).await {
            Ok(download) => download,
            Err(err) if is_file_not_found(&err) => return Err(Error::NotFound),
            Err(err) => return Err(store_error("open GridFS download")(err)),
        };

        let mut buffer = Vec::new();
        download
            .read_to_end(&mut buffer)
            .await
            .map_err(io_error("read GridFS blob"))?;
        Ok(Bytes::from(buffer))
    }

    async fn delete_blob(&self, file_id: &FileId) -> Result<bool> {
        match self.bucket.delete(blob_id(file_id)).await {
            Ok(()) => Ok(true),
            Err(err) if is_file_not_found(&err) => Ok(false),
            Err(err) => Err(store_error("delete GridFS blob")(err)),
        }
    }

    async fn find_by_key(&self, attributes_key: &str) -> Result<Vec<FileId>> {
        let files = self.files(self.owned_by(attributes_key)).await?;
        Ok(files.iter().map(|file| file_id_of(&file.id)).collect())
    }

    async fn existing(&self, file_ids: &[FileId]) -> Result<HashSet<FileId>> {
        if file_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let files = self.files(ids_filter(file_ids)).await?;
        Ok(files.iter().map(|file| file_id_of(&file.id)).collect())
    }

    fn list(&self) -> BoxStream<'_, Result<BlobInfo>> {
        let field = self.key_field.as_str();
        stream::once(async move { self.bucket.find(self.owned()).await })
            .try_flatten()
            .map_err(store_error("list GridFS files"))
            .map_ok(move |file| BlobInfo {
                file_id: file_id_of(&file.id),
                key: file
                    .metadata
                    .as_ref()
                    .and_then(|metadata| metadata.get_str(field).ok())
                    .map(str::to_string),
                uploaded_at: file.upload_date.to_chrono(),
            })
            .boxed()
    }
}
