use crate::intent::Document;
use crate::pipeline::CompiledPipeline;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A store call that failed, with what was attempted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreFailure {
    pub message: String,
    /// Compiled shape, or `"intent"` when compilation never happened.
    pub shape: String,
    /// The filter or pipeline that was sent, rendered as JSON.
    pub attempted: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Raw documents from a filtered read.
    Records(Vec<Document>),
    /// Aggregation rows (`{key, metric}` pairs).
    Groups(Vec<Document>),
    Count(u64),
    Facets(BTreeMap<String, Vec<Document>>),
    Error(StoreFailure),
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }

    pub fn rows(&self) -> &[Document] {
        match self {
            QueryResult::Records(r) | QueryResult::Groups(r) => r,
            _ => &[],
        }
    }

    /// What the narrator sees: bare rows for lists, the tagged object
    /// otherwise.
    pub fn payload(&self) -> Value {
        match self {
            QueryResult::Records(rows) | QueryResult::Groups(rows) => json!(rows),
            other => other.to_json(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            QueryResult::Records(rows) | QueryResult::Groups(rows) => json!({ "data": rows }),
            QueryResult::Count(n) => json!({ "count": n }),
            QueryResult::Facets(f) => json!({ "facets": f }),
            QueryResult::Error(e) => json!({
                "error": e.message,
                "shape": e.shape,
                "attempted": e.attempted,
            }),
        }
    }
}

/// A result together with the query that produced it.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub result: QueryResult,
    /// Absent when the intent could not be read at all.
    pub compiled: Option<CompiledPipeline>,
}

impl QueryOutcome {
    pub fn failed(message: impl Into<String>, attempted: Value) -> Self {
        Self {
            result: QueryResult::Error(StoreFailure {
                message: message.into(),
                shape: "intent".into(),
                attempted,
            }),
            compiled: None,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut v = self.result.to_json();
        if let Value::Object(m) = &mut v {
            m.insert(
                "query".into(),
                self.compiled
                    .as_ref()
                    .map(CompiledPipeline::to_json)
                    .unwrap_or(Value::Null),
            );
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompiledQuery, QueryShape};

    #[test]
    fn error_outcome_keeps_the_attempted_query() {
        let outcome = QueryOutcome {
            result: QueryResult::Error(StoreFailure {
                message: "connection refused".into(),
                shape: "count".into(),
                attempted: json!({"filters": {"Ward": "ICU"}}),
            }),
            compiled: Some(CompiledPipeline {
                shape: QueryShape::Count,
                query: CompiledQuery::Count {
                    filter: json!({"Ward": "ICU"}).as_object().cloned().unwrap(),
                },
                warnings: vec![],
            }),
        };
        let v = outcome.to_json();
        assert_eq!(v["error"], json!("connection refused"));
        assert_eq!(v["attempted"]["filters"]["Ward"], json!("ICU"));
        assert_eq!(v["query"]["type"], json!("count_documents"));
    }

    #[test]
    fn count_renders_as_scalar() {
        assert_eq!(QueryResult::Count(4).to_json(), json!({"count": 4}));
        assert!(QueryResult::Count(4).rows().is_empty());
    }
}
