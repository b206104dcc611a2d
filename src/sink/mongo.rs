use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{self, doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde_json::Value;
use tracing::debug;

use super::Sink;
use crate::errors::{AuditError, AuditResult};

const SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes audit documents into a MongoDB database, one connection per persistence pass.
pub struct MongoSink {
    uri: String,
    database: String,
    client: Option<Client>,
}

impl MongoSink {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            client: None,
        }
    }

    fn collection(&self, name: &str) -> AuditResult<Collection<Document>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AuditError::persistence("mongo", name, "sink is not open"))?;
        Ok(client.database(&self.database).collection::<Document>(name))
    }
}

fn to_document(collection: &str, value: &Value) -> AuditResult<Document> {
    bson::to_document(value).map_err(|err| AuditError::persistence("mongo", collection, err))
}

#[async_trait]
impl Sink for MongoSink {
    fn name(&self) -> &str {
        "mongo"
    }

    async fn open(&mut self) -> AuditResult<()> {
        let mut options = ClientOptions::parse(&self.uri)
            .await
            .map_err(|err| AuditError::persistence("mongo", "connection", err))?;
        options.app_name = Some("siteaudit".to_string());
        if options.server_selection_timeout.is_none() {
            options.server_selection_timeout = Some(SELECTION_TIMEOUT);
        }
        let client = Client::with_options(options)
            .map_err(|err| AuditError::persistence("mongo", "connection", err))?;
        client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|err| AuditError::persistence("mongo", "connection", err))?;
        debug!(target: "siteaudit::sink", database = %self.database, "mongo connected");
        self.client = Some(client);
        Ok(())
    }

    async fn save(&mut self, collection: &str, document: &Value) -> AuditResult<()> {
        let doc = to_document(collection, document)?;
        self.collection(collection)?
            .insert_one(doc, None)
            .await
            .map(|_| ())
            .map_err(|err| AuditError::persistence("mongo", collection, err))
    }

    async fn save_many(&mut self, collection: &str, documents: &[Value]) -> AuditResult<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let docs = documents
            .iter()
            .map(|value| to_document(collection, value))
            .collect::<AuditResult<Vec<_>>>()?;
        self.collection(collection)?
            .insert_many(docs, None)
            .await
            .map(|_| ())
            .map_err(|err| AuditError::persistence("mongo", collection, err))
    }

    async fn close(&mut self) -> AuditResult<()> {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        Ok(())
    }
}
