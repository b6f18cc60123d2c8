use crate::executor::QueryEngine;
use chrono::Utc;
use medquery_core::time::preprocess_time_phrases;
use medquery_core::{
    parse_oracle_response, shape, Analysis, IntentOracle, Narrator, QueryError, QueryOutcome,
    Result, SchemaDescriptor, TemplateNarrator,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything the caller gets back for one question.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub status: &'static str,
    pub analysis: Value,
    pub db_results: Value,
    pub mongo_query: Value,
    pub display: String,
    pub final_answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(skip)]
    pub failed: bool,
}

/// question → oracle → engine → shaper → narrator.
#[derive(Clone)]
pub struct QueryService {
    engine: QueryEngine,
    oracle: Option<Arc<dyn IntentOracle>>,
    narrator: Arc<dyn Narrator>,
}

impl QueryService {
    pub fn new(engine: QueryEngine) -> Self {
        Self {
            engine,
            oracle: None,
            narrator: Arc::new(TemplateNarrator),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn IntentOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = narrator;
        self
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn schema(&self, collection: &str) -> Result<Arc<SchemaDescriptor>> {
        self.engine
            .schemas()
            .get(collection)
            .ok_or_else(|| QueryError::Schema(format!("unknown collection {collection}")))
    }

    /// Full round trip for a free-text question. Only an unknown collection
    /// or a missing oracle is an error; everything downstream degrades into
    /// the response.
    pub async fn handle(&self, collection: &str, question: &str) -> Result<QueryResponse> {
        let schema = self.schema(collection)?;
        let oracle = self
            .oracle
            .as_ref()
            .ok_or_else(|| QueryError::Config("no intent oracle configured".into()))?;
        let question = preprocess_time_phrases(question, Utc::now().date_naive());
        let analysis = match oracle.analyze(&question, &schema).await {
            Ok(raw) => parse_oracle_response(&raw),
            Err(e) => Analysis::Failed {
                error: format!("oracle invocation failed: {e}"),
                raw: String::new(),
            },
        };
        Ok(self.respond(&schema, &question, analysis).await)
    }

    /// Executes an already-obtained oracle analysis.
    pub async fn respond(
        &self,
        schema: &SchemaDescriptor,
        question: &str,
        analysis: Analysis,
    ) -> QueryResponse {
        let (status, outcome) = match &analysis {
            Analysis::Intent { intent, .. } => ("analyzed", self.engine.execute(schema, intent).await),
            Analysis::Partial { error, intent, .. } => {
                warn!(collection = schema.collection(), %error, "oracle reported an error; running a plain read");
                ("oracle_error", self.engine.execute(schema, intent).await)
            }
            Analysis::Failed { error, raw } => {
                warn!(collection = schema.collection(), %error, "oracle output unusable");
                (
                    "oracle_error",
                    QueryOutcome::failed(error.clone(), json!({ "raw": raw })),
                )
            }
        };
        let display = shape(&outcome.result);
        let analysis_json = analysis.to_json();
        let final_answer = match self.narrator.narrate(question, &analysis_json, &display).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "narrator failed; using shaped result");
                display.render()
            }
        };
        let shape_name = outcome.compiled.as_ref().map(|c| c.shape.as_str().to_string());
        info!(
            collection = schema.collection(),
            status,
            shape = shape_name.as_deref().unwrap_or("none"),
            failed = outcome.result.is_error(),
            "question answered"
        );
        QueryResponse {
            status,
            analysis: analysis_json,
            db_results: outcome.result.payload(),
            mongo_query: outcome
                .compiled
                .as_ref()
                .map(|c| c.to_json())
                .unwrap_or(Value::Null),
            display: display.render(),
            final_answer,
            shape: shape_name,
            failed: outcome.result.is_error(),
        }
    }
}
