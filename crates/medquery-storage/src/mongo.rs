use crate::traits::DocumentStore;
use bson::Bson;
use futures::TryStreamExt;
use medquery_core::{Document, QueryError, Result};
use mongodb::options::{
    ClientOptions, FindOptions, ReadPreference, SelectionCriteria, Tls, TlsOptions,
};
use mongodb::{Client, Database};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub server_selection_timeout: Duration,
    /// Upper bound on each count/find/aggregate round trip.
    pub operation_timeout: Duration,
    pub tls: bool,
    pub tls_allow_invalid_certificates: bool,
}

impl MongoConfig {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            server_selection_timeout: Duration::from_millis(5000),
            operation_timeout: Duration::from_millis(5000),
            tls: true,
            tls_allow_invalid_certificates: false,
        }
    }
}

/// A shared, read-only handle onto one database.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    operation_timeout: Duration,
}

fn mongo_err(e: mongodb::error::Error) -> QueryError {
    QueryError::Store(e.to_string())
}

impl MongoStore {
    /// Builds the client. The driver connects lazily, so an unreachable
    /// server surfaces on the first operation rather than here.
    pub async fn connect(cfg: &MongoConfig) -> Result<Self> {
        let mut opts = ClientOptions::parse(&cfg.uri)
            .await
            .map_err(|e| QueryError::Config(format!("invalid mongo uri: {e}")))?;
        opts.app_name = Some("medquery".into());
        opts.server_selection_timeout = Some(cfg.server_selection_timeout);
        opts.connect_timeout = Some(cfg.server_selection_timeout);
        if cfg.tls && opts.tls.is_none() {
            let mut tls = TlsOptions::default();
            tls.allow_invalid_certificates = Some(cfg.tls_allow_invalid_certificates);
            opts.tls = Some(Tls::Enabled(tls));
        }
        if opts.selection_criteria.is_none() {
            opts.selection_criteria = Some(SelectionCriteria::ReadPreference(ReadPreference::Primary));
        }
        let client = Client::with_options(opts).map_err(mongo_err)?;
        Ok(Self {
            db: client.database(&cfg.database),
            operation_timeout: cfg.operation_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, mongodb::error::Error>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(r) => r.map_err(mongo_err),
            Err(_) => Err(QueryError::Store(format!(
                "{op} timed out after {}ms",
                self.operation_timeout.as_millis()
            ))),
        }
    }
}

fn to_bson_doc(d: &Document) -> Result<bson::Document> {
    bson::to_document(d).map_err(|e| QueryError::Store(format!("cannot encode query: {e}")))
}

fn to_bson_stage(v: &Value) -> Result<bson::Document> {
    match v {
        Value::Object(m) => to_bson_doc(m),
        other => Err(QueryError::Store(format!("pipeline stage is not a document: {other}"))),
    }
}

/// Result documents as plain JSON: ObjectIds become hex strings and
/// dates RFC 3339 strings.
pub fn bson_to_json(b: Bson) -> Value {
    match b {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(v) => Value::Bool(v),
        Bson::Int32(v) => Value::from(v),
        Bson::Int64(v) => Value::from(v),
        Bson::Double(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => Value::String(s),
            Err(_) => Value::from(dt.timestamp_millis()),
        },
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(d) => Value::Object(doc_to_json(d)),
        other => other.into_relaxed_extjson(),
    }
}

pub fn doc_to_json(d: bson::Document) -> Map<String, Value> {
    d.into_iter().map(|(k, v)| (k, bson_to_json(v))).collect()
}

#[async_trait::async_trait]
impl DocumentStore for MongoStore {
    async fn count(&self, collection: &str, filter: &Document) -> Result<u64> {
        let filter = to_bson_doc(filter)?;
        debug!(collection, %filter, "count_documents");
        let coll = self.db.collection::<bson::Document>(collection);
        self.bounded("count_documents", coll.count_documents(filter, None))
            .await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        projection: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let filter = to_bson_doc(filter)?;
        let projection = projection.map(to_bson_doc).transpose()?;
        debug!(collection, %filter, ?projection, "find");
        let opts = FindOptions::builder().projection(projection).build();
        let coll = self.db.collection::<bson::Document>(collection);
        let rows: Vec<bson::Document> = self
            .bounded("find", async {
                coll.find(filter, opts).await?.try_collect().await
            })
            .await?;
        Ok(rows.into_iter().map(doc_to_json).collect())
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Document>> {
        let stages = pipeline
            .iter()
            .map(to_bson_stage)
            .collect::<Result<Vec<_>>>()?;
        debug!(collection, stages = stages.len(), "aggregate");
        let coll = self.db.collection::<bson::Document>(collection);
        let rows: Vec<bson::Document> = self
            .bounded("aggregate", async {
                coll.aggregate(stages, None).await?.try_collect().await
            })
            .await?;
        Ok(rows.into_iter().map(doc_to_json).collect())
    }

    fn kind(&self) -> &'static str {
        "mongodb"
    }
}
