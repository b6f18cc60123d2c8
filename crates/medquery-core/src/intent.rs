use crate::errors::{QueryError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A MongoDB-shaped JSON document.
pub type Document = serde_json::Map<String, Value>;

/// One entry of the requested field list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldRef {
    Path(String),
    /// A derived-field descriptor such as `{"day": {"$dateToString": ...}}`.
    Computed(Value),
}

impl FieldRef {
    /// Best-effort column name: the path itself, or the first key of a
    /// computed descriptor.
    pub fn display_name(&self) -> String {
        match self {
            FieldRef::Path(p) => p.clone(),
            FieldRef::Computed(Value::Object(m)) => match m.keys().next() {
                Some(k) => k.clone(),
                None => "{}".to_string(),
            },
            FieldRef::Computed(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GroupKey {
    Path(String),
    Expr(Value),
}

impl GroupKey {
    /// Output column for the group key once projected back out of `_id`.
    pub fn label(&self) -> String {
        match self {
            GroupKey::Path(p) => p.rsplit('.').next().unwrap_or(p).to_string(),
            GroupKey::Expr(Value::Object(m)) if m.contains_key("$dateToString") => "date".into(),
            GroupKey::Expr(_) => "group".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Only the exact string `"desc"` sorts descending.
    pub fn parse(v: Option<&Value>) -> Self {
        match v.and_then(Value::as_str) {
            Some("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        }
    }

    pub fn direction(self) -> i64 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    CountDistinct,
    Distinct,
    Avg,
    Min,
    Max,
    Sum,
    Facet,
    /// `["min", "max"]`
    MinMax,
    Unknown(String),
}

impl AggregationKind {
    fn parse_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => AggregationKind::Count,
            "count_distinct" | "distinct_count" => AggregationKind::CountDistinct,
            "distinct" => AggregationKind::Distinct,
            "avg" | "average" | "mean" => AggregationKind::Avg,
            "min" => AggregationKind::Min,
            "max" => AggregationKind::Max,
            "sum" => AggregationKind::Sum,
            "facet" => AggregationKind::Facet,
            other => AggregationKind::Unknown(other.to_string()),
        }
    }

    fn parse(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(Self::parse_str(s)),
            Value::Array(items) => {
                let kinds: Vec<Self> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(Self::parse_str)
                    .collect();
                match kinds.as_slice() {
                    [single] => Some(single.clone()),
                    [a, b]
                        if (*a == AggregationKind::Min && *b == AggregationKind::Max)
                            || (*a == AggregationKind::Max && *b == AggregationKind::Min) =>
                    {
                        Some(AggregationKind::MinMax)
                    }
                    _ => Some(AggregationKind::Unknown(v.to_string())),
                }
            }
            _ => None,
        }
    }

    /// Accumulator operator for the numeric reductions.
    pub fn reduction_operator(&self) -> Option<&'static str> {
        match self {
            AggregationKind::Avg => Some("$avg"),
            AggregationKind::Min => Some("$min"),
            AggregationKind::Max => Some("$max"),
            AggregationKind::Sum => Some("$sum"),
            _ => None,
        }
    }

    pub fn metric_name(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::CountDistinct => "distinctCount",
            AggregationKind::Avg => "average",
            AggregationKind::Min => "minValue",
            AggregationKind::Max => "maxValue",
            AggregationKind::Sum => "total",
            _ => "value",
        }
    }
}

/// The `aggregation` object of an intent. Facet branches reuse the same
/// shape, optionally with their own `filters`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregationSpec {
    pub kind: Option<AggregationKind>,
    pub group_by: Option<GroupKey>,
    pub field: Option<String>,
    pub distinct_field: Option<String>,
    pub sort_order: SortOrder,
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Document::is_empty")]
    pub filters: Document,
    #[serde(skip_serializing_if = "Document::is_empty")]
    pub add_fields: Document,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub facets: BTreeMap<String, AggregationSpec>,
}

impl AggregationSpec {
    pub fn of(kind: AggregationKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn is(&self, kind: &AggregationKind) -> bool {
        self.kind.as_ref() == Some(kind)
    }

    fn from_value(v: &Value, warnings: &mut Vec<String>) -> Option<Self> {
        let obj = v.as_object()?;
        let mut spec = AggregationSpec {
            kind: obj.get("type").and_then(AggregationKind::parse),
            group_by: obj.get("group_by").and_then(parse_group_key),
            field: obj.get("field").and_then(parse_path),
            distinct_field: obj.get("distinct_field").and_then(parse_path),
            sort_order: SortOrder::parse(obj.get("sort_order")),
            limit: obj.get("limit").and_then(parse_limit),
            filters: obj.get("filters").and_then(Value::as_object).cloned().unwrap_or_default(),
            add_fields: obj
                .get("add_fields")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            facets: BTreeMap::new(),
        };
        if spec.distinct_field.is_none() {
            spec.distinct_field = obj
                .get("count_field")
                .and_then(parse_path)
                .filter(|f| f != "*");
        }
        if let Some(raw) = obj.get("facets").or_else(|| obj.get("facet")) {
            spec.facets = parse_facets(raw, warnings);
        }
        Some(spec)
    }
}

fn parse_facets(raw: &Value, warnings: &mut Vec<String>) -> BTreeMap<String, AggregationSpec> {
    let entries: Vec<(String, &Value)> = match raw {
        Value::Object(m) => m.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("facet_{i}"), v))
            .collect(),
        _ => {
            warnings.push("facets is neither a mapping nor a list; ignored".into());
            return BTreeMap::new();
        }
    };
    let mut out = BTreeMap::new();
    for (name, v) in entries {
        // a branch given as `[ {...} ]` uses its single element
        let body = match v {
            Value::Array(items) => items.iter().find(|i| i.is_object()),
            other => Some(other),
        };
        match body.and_then(|b| AggregationSpec::from_value(b, warnings)) {
            Some(spec) => {
                out.insert(name, spec);
            }
            None => warnings.push(format!("facet {name} is not an aggregation object; ignored")),
        }
    }
    out
}

fn parse_path(v: &Value) -> Option<String> {
    let s = v.as_str()?.trim();
    let s = s.strip_prefix('$').unwrap_or(s);
    if s.is_empty() || s.starts_with('$') {
        return None;
    }
    Some(s.to_string())
}

fn parse_group_key(v: &Value) -> Option<GroupKey> {
    match v {
        Value::String(_) => parse_path(v).map(GroupKey::Path),
        Value::Object(m) if !m.is_empty() => Some(GroupKey::Expr(v.clone())),
        _ => None,
    }
}

fn parse_limit(v: &Value) -> Option<u64> {
    let n = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (n > 0).then_some(n as u64)
}

/// A structured request as produced by the intent oracle, after defensive
/// normalisation of its shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryIntent {
    pub intent: Option<String>,
    pub filters: Document,
    pub fields: Vec<FieldRef>,
    pub aggregation: Option<AggregationSpec>,
    #[serde(rename = "missingFilters", skip_serializing_if = "Vec::is_empty")]
    pub missing_filters: Vec<String>,
    /// Repairs applied while reading the oracle output.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl QueryIntent {
    /// Reads an oracle output object. Only a non-object top level is an
    /// error; every other shape problem is repaired and noted in `warnings`.
    pub fn from_value(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| QueryError::MalformedIntent(format!("expected an object, got {v}")))?;
        let mut warnings = Vec::new();

        let filters = match obj.get("filters") {
            Some(Value::Object(m)) => m.clone(),
            None | Some(Value::Null) => Document::new(),
            Some(other) => {
                warnings.push(format!("filters is not a mapping ({other}); ignored"));
                Document::new()
            }
        };

        let fields = match obj.get("fields") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|f| match f {
                    Value::String(s) if !s.trim().is_empty() => Some(FieldRef::Path(s.trim().to_string())),
                    Value::Object(_) => Some(FieldRef::Computed(f.clone())),
                    Value::Null => None,
                    other => Some(FieldRef::Path(other.to_string())),
                })
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![FieldRef::Path(s.trim().to_string())],
            _ => Vec::new(),
        };

        let aggregation = match obj.get("aggregation") {
            None | Some(Value::Null) => None,
            Some(raw) => {
                let spec = AggregationSpec::from_value(raw, &mut warnings);
                if spec.is_none() {
                    warnings.push(format!("aggregation is not an object ({raw}); ignored"));
                }
                spec
            }
        };

        let missing_filters = obj
            .get("missingFilters")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        Ok(QueryIntent {
            intent: obj.get("intent").and_then(Value::as_str).map(String::from),
            filters,
            fields,
            aggregation,
            missing_filters,
            warnings,
        })
    }
}
