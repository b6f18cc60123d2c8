//! Seams to the language-model collaborators.
//!
//! Neither side is trusted: oracle text is parsed defensively into an
//! [`Analysis`], and narrator failures are absorbed by the caller.

use crate::errors::{QueryError, Result};
use crate::intent::QueryIntent;
use crate::schema::SchemaDescriptor;
use crate::shape::DisplayForm;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"//[^\n]*").unwrap());

/// Turns a question into raw oracle output, restricted to the schema's
/// field list.
#[async_trait]
pub trait IntentOracle: Send + Sync {
    async fn analyze(&self, question: &str, schema: &SchemaDescriptor) -> Result<String>;
}

/// Turns a shaped result into the final answer text.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, question: &str, analysis: &Value, display: &DisplayForm) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Intent { intent: QueryIntent, raw: Value },
    /// The oracle reported an error but still named filters or fields.
    /// Only a filtered read is attempted; the error tag is kept.
    Partial {
        error: String,
        intent: QueryIntent,
        raw: Value,
    },
    Failed { error: String, raw: String },
}

impl Analysis {
    pub fn to_json(&self) -> Value {
        match self {
            Analysis::Intent { raw, .. } | Analysis::Partial { raw, .. } => raw.clone(),
            Analysis::Failed { error, raw } => json!({ "error": error, "raw": raw }),
        }
    }

    pub fn from_value(v: Value) -> Self {
        if let Some(err) = v.get("error") {
            let error = match err {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return match fallback_read(&v) {
                Some(intent) => Analysis::Partial { error, intent, raw: v },
                None => Analysis::Failed {
                    error,
                    raw: v.to_string(),
                },
            };
        }
        match QueryIntent::from_value(&v) {
            Ok(intent) => Analysis::Intent { intent, raw: v },
            Err(e) => Analysis::Failed {
                error: QueryError::OracleFormat(e.to_string()).to_string(),
                raw: v.to_string(),
            },
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Analysis::Intent { .. } => None,
            Analysis::Partial { error, .. } | Analysis::Failed { error, .. } => Some(error),
        }
    }
}

/// What survives of an error-tagged oracle object: its filters and fields
/// as a plain read, when it names any.
fn fallback_read(v: &Value) -> Option<QueryIntent> {
    let has_filters = v
        .get("filters")
        .and_then(Value::as_object)
        .is_some_and(|m| !m.is_empty());
    let has_fields = v
        .get("fields")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty());
    if !has_filters && !has_fields {
        return None;
    }
    let mut intent = QueryIntent::from_value(v).ok()?;
    intent.aggregation = None;
    Some(intent)
}

/// Extracts the outermost `{...}` span, strips `/* */` and `//` comments
/// and parses what is left.
pub fn parse_oracle_response(raw: &str) -> Analysis {
    let span = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Analysis::Failed {
                error: QueryError::OracleFormat("no JSON object in oracle output".into()).to_string(),
                raw: raw.to_string(),
            }
        }
    };
    let cleaned = BLOCK_COMMENT.replace_all(span, "");
    let cleaned = LINE_COMMENT.replace_all(&cleaned, "");
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(v) => Analysis::from_value(v),
        Err(e) => Analysis::Failed {
            error: QueryError::OracleFormat(format!("JSON parsing failed: {e}")).to_string(),
            raw: raw.to_string(),
        },
    }
}

/// Deterministic narrator: restates the question and presents the shaped
/// result as-is.
#[derive(Debug, Default, Clone)]
pub struct TemplateNarrator;

#[async_trait]
impl Narrator for TemplateNarrator {
    async fn narrate(&self, question: &str, _analysis: &Value, display: &DisplayForm) -> Result<String> {
        let body = match display {
            DisplayForm::NoResults => "No results found for this query.".to_string(),
            DisplayForm::Error { .. } => {
                format!("The query could not be completed.\n\n{}", display.render())
            }
            other => other.render(),
        };
        Ok(format!("You asked: \"{question}\"\n\n{body}"))
    }
}
