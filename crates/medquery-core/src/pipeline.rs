use crate::intent::Document;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// One aggregation stage, in the subset the compiler emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Document),
    AddFields(Document),
    Group(Document),
    Sort(Document),
    Limit(u64),
    Project(Document),
    /// `$count` with the output field name.
    Count(String),
    Facet(BTreeMap<String, Vec<Stage>>),
}

impl Stage {
    pub fn operator(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::AddFields(_) => "$addFields",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Project(_) => "$project",
            Stage::Count(_) => "$count",
            Stage::Facet(_) => "$facet",
        }
    }

    pub fn to_json(&self) -> Value {
        let body = match self {
            Stage::Match(d)
            | Stage::AddFields(d)
            | Stage::Group(d)
            | Stage::Sort(d)
            | Stage::Project(d) => Value::Object(d.clone()),
            Stage::Limit(n) => json!(n),
            Stage::Count(name) => json!(name),
            Stage::Facet(branches) => Value::Object(
                branches
                    .iter()
                    .map(|(name, stages)| (name.clone(), pipeline_json(stages)))
                    .collect(),
            ),
        };
        let mut stage = Document::new();
        stage.insert(self.operator().to_string(), body);
        Value::Object(stage)
    }
}

pub fn pipeline_json(stages: &[Stage]) -> Value {
    Value::Array(stages.iter().map(Stage::to_json).collect())
}

/// What the store is asked to run.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledQuery {
    Find {
        filter: Document,
        projection: Option<Document>,
    },
    Count {
        filter: Document,
    },
    Aggregate {
        pipeline: Vec<Stage>,
    },
}

impl CompiledQuery {
    /// Which store API the query is routed to.
    pub fn execution_type(&self) -> &'static str {
        match self {
            CompiledQuery::Find { .. } => "find",
            CompiledQuery::Count { .. } => "count_documents",
            CompiledQuery::Aggregate { .. } => "aggregate",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CompiledQuery::Find { filter, projection } => json!({
                "type": self.execution_type(),
                "filters": filter,
                "projection": projection,
            }),
            CompiledQuery::Count { filter } => json!({
                "type": self.execution_type(),
                "filters": filter,
            }),
            CompiledQuery::Aggregate { pipeline } => json!({
                "type": self.execution_type(),
                "pipeline": pipeline_json(pipeline),
            }),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        match self {
            CompiledQuery::Aggregate { pipeline } => pipeline,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    Distinct,
    CountDistinct,
    GroupedCount,
    GroupedReduction,
    Reduction,
    Facet,
    MinMax,
    Count,
    Find,
}

impl QueryShape {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryShape::Distinct => "distinct",
            QueryShape::CountDistinct => "count_distinct",
            QueryShape::GroupedCount => "grouped_count",
            QueryShape::GroupedReduction => "grouped_reduction",
            QueryShape::Reduction => "reduction",
            QueryShape::Facet => "facet",
            QueryShape::MinMax => "min_max",
            QueryShape::Count => "count",
            QueryShape::Find => "find",
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPipeline {
    pub shape: QueryShape,
    pub query: CompiledQuery,
    /// Degradations applied while compiling a malformed intent.
    pub warnings: Vec<String>,
}

impl CompiledPipeline {
    pub fn to_json(&self) -> Value {
        let mut v = self.query.to_json();
        if let Value::Object(m) = &mut v {
            m.insert("shape".into(), json!(self.shape));
            if !self.warnings.is_empty() {
                m.insert("warnings".into(), json!(self.warnings));
            }
        }
        v
    }
}
