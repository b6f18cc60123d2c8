use medquery_core::{Document, Result};
use serde_json::Value;

/// Read-only document store. Implementations surface connectivity,
/// timeout and rejected-query problems as `QueryError::Store` and never
/// retry on their own.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn count(&self, collection: &str, filter: &Document) -> Result<u64>;

    /// `projection` of `None` returns whole documents.
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        projection: Option<&Document>,
    ) -> Result<Vec<Document>>;

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Document>>;

    /// Backend name for logs.
    fn kind(&self) -> &'static str;
}
