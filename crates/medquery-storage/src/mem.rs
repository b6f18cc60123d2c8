use crate::eval::{matches, project, run_pipeline};
use crate::traits::DocumentStore;
use medquery_core::{Document, QueryError, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Collections held in process. Unknown collections read as empty, the
/// same as on a real server.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Document>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut inner = self.inner.write();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    /// Loads `{ "<collection>": [doc, ...], ... }`.
    pub fn load(&self, seed: &Value) -> Result<usize> {
        let collections = seed
            .as_object()
            .ok_or_else(|| QueryError::Config("seed data must map collection names to arrays".into()))?;
        let mut loaded = 0;
        for (name, docs) in collections {
            let docs = docs
                .as_array()
                .ok_or_else(|| QueryError::Config(format!("seed collection {name} is not an array")))?;
            let mut batch = Vec::with_capacity(docs.len());
            for d in docs {
                let d = d
                    .as_object()
                    .ok_or_else(|| QueryError::Config(format!("seed collection {name} holds a non-document")))?;
                batch.push(d.clone());
            }
            loaded += batch.len();
            self.insert_many(name, batch);
        }
        Ok(loaded)
    }

    pub fn from_seed_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| QueryError::Config(format!("read {}: {e}", path.display())))?;
        let seed: Value = serde_json::from_str(&text)
            .map_err(|e| QueryError::Config(format!("parse {}: {e}", path.display())))?;
        let store = Self::new();
        let n = store.load(&seed)?;
        tracing::info!(path = %path.display(), documents = n, "seeded in-memory store");
        Ok(store)
    }

    fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.inner
            .read()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .read()
            .collections
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryStore {
    async fn count(&self, collection: &str, filter: &Document) -> Result<u64> {
        let inner = self.inner.read();
        let mut n = 0;
        for d in inner.collections.get(collection).into_iter().flatten() {
            if matches(d, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        projection: Option<&Document>,
    ) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        for d in self.snapshot(collection) {
            if !matches(&d, filter)? {
                continue;
            }
            out.push(match projection {
                Some(p) if !p.is_empty() => project(&d, p)?,
                _ => d,
            });
        }
        Ok(out)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Document>> {
        run_pipeline(self.snapshot(collection), pipeline)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
