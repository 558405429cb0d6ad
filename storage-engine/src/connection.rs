use crate::errors::store_error;
use mongodb::bson::Document;
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::{Client, Collection, Database};
use shared::config::{Endpoint, MongoSettings};
use shared::{Error, Result};
use tokio::sync::OnceCell;
use tracing::info;

const APP_NAME: &str = "imagecache";

/// Database and collection resolved from one set of settings
#[derive(Clone, Debug)]
pub struct MongoHandle {
    pub database: Database,
    pub collection: Collection<Document>,
}

/// Lazily builds the client for one storage. The first successful connect is
/// reused by every later call, concurrent callers included.
pub struct MongoConnector {
    settings: MongoSettings,
    handle: OnceCell<MongoHandle>,
}

impl MongoConnector {
    pub fn new(settings: MongoSettings) -> Self {
        Self {
            settings,
            handle: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &MongoSettings {
        &self.settings
    }

    pub async fn connect(&self) -> Result<MongoHandle> {
        self.handle
            .get_or_try_init(|| async {
                let options = client_options(&self.settings.endpoint).await?;
                let client = Client::with_options(options).map_err(store_error("create MongoDB client"))?;
                let database = client.database(&self.settings.database);
                let collection = database.collection::<Document>(&self.settings.collection);

                info!(
                    "MongoDB client ready for {} ({}.{})",
                    self.settings.endpoint.describe(),
                    self.settings.database,
                    self.settings.collection
                );
                Ok(MongoHandle {
                    database,
                    collection,
                })
            })
            .await
            .cloned()
    }
}

/// Client options for an endpoint. A full URI wins over host and port.
pub async fn client_options(endpoint: &Endpoint) -> Result<ClientOptions> {
    match endpoint {
        Endpoint::Uri(uri) => {
            let mut options = ClientOptions::parse(uri)
                .await
                .map_err(|e| Error::Configuration(format!("Invalid MongoDB URI: {}", e)))?;
            if options.app_name.is_none() {
                options.app_name = Some(APP_NAME.to_string());
            }
            Ok(options)
        }
        Endpoint::HostPort { host, port } => Ok(host_port_options(host, *port)),
    }
}

pub fn host_port_options(host: &str, port: u16) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.hosts = vec![ServerAddress::Tcp {
        host: host.to_string(),
        port: Some(port),
    }];
    options.app_name = Some(APP_NAME.to_string());
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: Endpoint) -> MongoSettings {
        MongoSettings {
            endpoint,
            database: "thumbor".to_string(),
            collection: "images".to_string(),
        }
    }

    #[test]
    fn test_host_port_options() {
        let options = host_port_options("mongo.internal", 27018);
        assert_eq!(
            options.hosts,
            vec![ServerAddress::Tcp {
                host: "mongo.internal".to_string(),
                port: Some(27018),
            }]
        );
        assert_eq!(options.app_name.as_deref(), Some(APP_NAME));
    }

    #[tokio::test]
    async fn test_uri_options_keep_hosts() {
        let endpoint = Endpoint::Uri("mongodb://db1:27017,db2:27017/?appName=thumbor".to_string());
        let options = client_options(&endpoint).await.unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert_eq!(options.app_name.as_deref(), Some("thumbor"));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_a_configuration_error() {
        let endpoint = Endpoint::Uri("postgres://localhost".to_string());
        let result = client_options(&endpoint).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connect_resolves_names_once() {
        let connector = MongoConnector::new(settings(Endpoint::HostPort {
            host: "localhost".to_string(),
            port: 27017,
        }));

        // the driver connects lazily, so no server is needed here
        let first = connector.connect().await.unwrap();
        let second = connector.connect().await.unwrap();

        assert_eq!(first.database.name(), "thumbor");
        assert_eq!(first.collection.name(), "images");
        assert_eq!(second.collection.name(), first.collection.name());
    }
}
