use crate::traits::DocumentStore;
use medquery_core::{
    CompiledPipeline, CompiledQuery, Compiler, Document, QueryIntent, QueryOutcome, QueryResult,
    QueryShape, SchemaDescriptor, SchemaRegistry, StoreFailure,
};
use medquery_core::compile::{MAX_BRANCH, MIN_BRANCH};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Compiles intents and runs them against one shared store handle.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn DocumentStore>,
    schemas: Arc<SchemaRegistry>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn DocumentStore>, schemas: SchemaRegistry) -> Self {
        Self {
            store,
            schemas: Arc::new(schemas),
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn compile(&self, schema: &SchemaDescriptor, intent: &QueryIntent) -> CompiledPipeline {
        Compiler::new(schema).compile(intent)
    }

    pub async fn execute(&self, schema: &SchemaDescriptor, intent: &QueryIntent) -> QueryOutcome {
        let compiled = self.compile(schema, intent);
        let result = self.run(schema.collection(), &compiled).await;
        QueryOutcome {
            result,
            compiled: Some(compiled),
        }
    }

    /// Reads raw oracle output and executes it. An unreadable intent is
    /// reported as an error result, not raised.
    pub async fn execute_value(&self, schema: &SchemaDescriptor, raw: &Value) -> QueryOutcome {
        match QueryIntent::from_value(raw) {
            Ok(intent) => self.execute(schema, &intent).await,
            Err(e) => QueryOutcome::failed(e.to_string(), raw.clone()),
        }
    }

    /// Runs a compiled query. Store failures come back as
    /// [`QueryResult::Error`] carrying the attempted query.
    pub async fn run(&self, collection: &str, compiled: &CompiledPipeline) -> QueryResult {
        let started = Instant::now();
        let outcome = match &compiled.query {
            CompiledQuery::Find { filter, projection } => self
                .store
                .find(collection, filter, projection.as_ref())
                .await
                .map(QueryResult::Records),
            CompiledQuery::Count { filter } => self
                .store
                .count(collection, filter)
                .await
                .map(QueryResult::Count),
            CompiledQuery::Aggregate { pipeline } => {
                let stages: Vec<Value> = pipeline.iter().map(|s| s.to_json()).collect();
                self.store
                    .aggregate(collection, &stages)
                    .await
                    .map(|rows| aggregate_result(compiled.shape, rows))
            }
        };
        match outcome {
            Ok(result) => {
                debug!(
                    collection,
                    shape = %compiled.shape,
                    store = self.store.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "query executed"
                );
                result
            }
            Err(e) => {
                warn!(collection, shape = %compiled.shape, error = %e, "store execution failed");
                QueryResult::Error(StoreFailure {
                    message: e.to_string(),
                    shape: compiled.shape.as_str().to_string(),
                    attempted: compiled.query.to_json(),
                })
            }
        }
    }
}

fn branch_rows(v: Option<&Value>) -> Vec<Document> {
    v.and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
        .unwrap_or_default()
}

fn aggregate_result(shape: QueryShape, rows: Vec<Document>) -> QueryResult {
    match shape {
        QueryShape::Facet => {
            let mut facets = BTreeMap::new();
            if let Some(out) = rows.first() {
                for (name, v) in out {
                    facets.insert(name.clone(), branch_rows(Some(v)));
                }
            }
            QueryResult::Facets(facets)
        }
        QueryShape::MinMax => {
            let Some(out) = rows.first() else {
                return QueryResult::Groups(vec![]);
            };
            let mut merged = Document::new();
            for branch in [MIN_BRANCH, MAX_BRANCH] {
                for row in branch_rows(out.get(branch)) {
                    merged.extend(row);
                }
            }
            if merged.is_empty() {
                QueryResult::Groups(vec![])
            } else {
                QueryResult::Groups(vec![merged])
            }
        }
        _ => QueryResult::Groups(rows),
    }
}
