use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::pipeline::task::PageRecord;

/// MongoDB server code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document with id '{id}' already exists")]
    Duplicate { id: String },

    #[error("failed to encode page record: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),

    #[error("document store error: {0}")]
    Backend(#[from] mongodb::error::Error),

    #[error("document store connection is closed")]
    Closed,
}

impl StoreError {
    /// Whether a later attempt could succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Encode(_))
    }
}

/// Persistence stage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Insert one record keyed by its id
    async fn save(&self, record: &PageRecord) -> Result<(), StoreError>;

    /// Whether saves reach durable storage
    fn is_durable(&self) -> bool;

    /// Release the connection. Idempotent.
    async fn close(&self);
}

/// Store used when no database is configured. Every save succeeds and is dropped.
#[derive(Debug, Default)]
pub struct NullPageStore;

#[async_trait]
impl PageStore for NullPageStore {
    async fn save(&self, record: &PageRecord) -> Result<(), StoreError> {
        debug!(id = %record.id, url = %record.url, "Persistence disabled; record not stored");
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn close(&self) {}
}

struct MongoHandle {
    client: Client,
    collection: Collection<Document>,
}

/// MongoDB implementation of the page store
pub struct MongoPageStore {
    handle: Mutex<Option<MongoHandle>>,
    database_name: String,
    collection_name: String,
}

impl MongoPageStore {
    /// Connect and verify the server answers
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name.get_or_insert_with(|| "quora-broker".to_string());

        let client = Client::with_options(options)?;
        let db = client.database(database);

        db.run_command(doc! { "ping": 1 }, None).await?;

        info!(database = %database, collection = %collection, "Connected to MongoDB");

        Ok(Self {
            handle: Mutex::new(Some(MongoHandle {
                collection: db.collection(collection),
                client,
            })),
            database_name: database.to_string(),
            collection_name: collection.to_string(),
        })
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database_name, self.collection_name)
    }
}

/// Convert a page record into the stored document
pub fn to_document(record: &PageRecord) -> Result<Document, StoreError> {
    Ok(mongodb::bson::to_document(record)?)
}

fn classify(error: mongodb::error::Error, id: &str) -> StoreError {
    let duplicate = matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    );

    if duplicate {
        StoreError::Duplicate { id: id.to_string() }
    } else {
        StoreError::Backend(error)
    }
}

#[async_trait]
impl PageStore for MongoPageStore {
    async fn save(&self, record: &PageRecord) -> Result<(), StoreError> {
        let document = to_document(record)?;

        let collection = match self.handle.lock().await.as_ref() {
            Some(handle) => handle.collection.clone(),
            None => return Err(StoreError::Closed),
        };

        collection
            .insert_one(document, None)
            .await
            .map_err(|e| classify(e, &record.id))?;

        debug!(id = %record.id, namespace = %self.namespace(), "Stored page record");

        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn close(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            drop(handle.collection);
            drop(handle.client);
            debug!("MongoDB connection released");
        }
    }
}

/// Pick the store variant once, at startup
pub async fn connect_store(
    uri: Option<&str>,
    database: &str,
    collection: &str,
) -> Result<Box<dyn PageStore>, StoreError> {
    match uri {
        Some(uri) => Ok(Box::new(MongoPageStore::connect(uri, database, collection).await?)),
        None => {
            warn!("Mongo not configured; persistence disabled");
            Ok(Box::new(NullPageStore))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task::FetchTask;
    use tokio_test::assert_ok;

    fn record() -> PageRecord {
        let task =
            FetchTask::new("https://example.org", Some("page-1".to_string()), Some(5)).unwrap();
        PageRecord::fetched(&task, 200, b"<html></html>", 10.0)
    }

    #[tokio::test]
    async fn test_null_store_accepts_every_record() {
        let store = NullPageStore;
        let task = FetchTask::new("https://unreachable.invalid", None, None).unwrap();

        assert_ok!(store.save(&record()).await);
        assert_ok!(store.save(&record()).await);
        assert_ok!(store.save(&PageRecord::failed(&task, "dns error", 1.0)).await);
        assert!(!store.is_durable());

        store.close().await;
        store.close().await;
        assert_ok!(store.save(&record()).await);
    }

    #[test]
    fn test_document_is_keyed_by_record_id() {
        let document = to_document(&record()).unwrap();

        assert_eq!(document.get_str("_id").unwrap(), "page-1");
        assert_eq!(document.get_str("url").unwrap(), "https://example.org");
        assert_eq!(document.get_i32("status_code").unwrap(), 200);
        assert!(document.get("error").is_some_and(|e| e.as_null().is_some()));
        assert_eq!(document.get_document("meta").unwrap().get_i64("priority").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_invalid_uri_is_a_startup_error() {
        let result = connect_store(Some("not-a-mongo-uri"), "db", "pages").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_missing_uri_selects_null_store() {
        let store = connect_store(None, "db", "pages").await.unwrap();
        assert!(!store.is_durable());
    }
}
