//! MongoDB backends for the image cache: metadata documents in a collection,
//! payload bytes in GridFS.

pub mod connection;
mod errors;
pub mod gridfs_blobs;
pub mod mongo_documents;

pub use connection::{MongoConnector, MongoHandle};
pub use gridfs_blobs::GridFsBlobStore;
pub use mongo_documents::MongoDocumentStore;

use async_trait::async_trait;
use imagecache::domain::KeyField;
use imagecache::ports::{Backends, StorageFactory};
use shared::Result;
use shared::config::MongoSettings;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Builds MongoDB backends, keeping one connector per distinct settings
#[derive(Default)]
pub struct MongoStorageFactory {
    connectors: Mutex<Vec<Arc<MongoConnector>>>,
}

impl MongoStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connector(&self, settings: &MongoSettings) -> Arc<MongoConnector> {
        let mut connectors = self.connectors.lock().await;
        if let Some(existing) = connectors.iter().find(|c| c.settings() == settings) {
            return Arc::clone(existing);
        }

        debug!(
            "New MongoDB connector for {}.{}",
            settings.database, settings.collection
        );
        let connector = Arc::new(MongoConnector::new(settings.clone()));
        connectors.push(Arc::clone(&connector));
        connector
    }
}

#[async_trait]
impl StorageFactory for MongoStorageFactory {
    async fn backends(&self, settings: &MongoSettings, key_field: KeyField) -> Result<Backends> {
        let handle = self.connector(settings).await.connect().await?;
        Ok(Backends {
            documents: Arc::new(MongoDocumentStore::new(handle.collection, key_field)),
            blobs: Arc::new(GridFsBlobStore::new(&handle.database, key_field)),
        })
    }
}
