//! Field-name canonicalization against a [`SchemaDescriptor`].
//!
//! Mapping is total: a name without an alias entry is kept as-is, so
//! already-canonical input and fields the schema does not know about both
//! pass straight through.

use crate::intent::{AggregationSpec, Document, FieldRef, GroupKey, QueryIntent};
use crate::schema::SchemaDescriptor;
use serde_json::Value;

const LOGICAL_OPERATORS: &[&str] = &["$and", "$or", "$nor"];

pub struct SchemaMapper<'a> {
    schema: &'a SchemaDescriptor,
}

impl<'a> SchemaMapper<'a> {
    pub fn new(schema: &'a SchemaDescriptor) -> Self {
        Self { schema }
    }

    pub fn path(&self, name: &str) -> String {
        self.schema.canonical(name).to_string()
    }

    /// Re-keys every filter by its canonical path. Values are untouched,
    /// except that the branches of `$and`/`$or`/`$nor` are re-keyed too.
    pub fn filters(&self, filters: &Document) -> Document {
        let mut out = Document::new();
        for (key, value) in filters {
            if LOGICAL_OPERATORS.contains(&key.as_str()) {
                let mapped = match value {
                    Value::Array(branches) => Value::Array(
                        branches
                            .iter()
                            .map(|b| match b {
                                Value::Object(m) => Value::Object(self.filters(m)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                out.insert(key.clone(), mapped);
                continue;
            }
            out.insert(self.path(key), value.clone());
        }
        out
    }

    /// Order-preserving; computed descriptors collapse to their display name.
    pub fn fields(&self, fields: &[FieldRef]) -> Vec<FieldRef> {
        fields
            .iter()
            .map(|f| FieldRef::Path(self.path(&f.display_name())))
            .collect()
    }

    pub fn aggregation(&self, spec: &AggregationSpec) -> AggregationSpec {
        AggregationSpec {
            kind: spec.kind.clone(),
            group_by: spec.group_by.as_ref().map(|g| match g {
                GroupKey::Path(p) => GroupKey::Path(self.path(p)),
                GroupKey::Expr(e) => GroupKey::Expr(self.expression(e)),
            }),
            field: spec.field.as_deref().map(|f| self.path(f)),
            distinct_field: spec.distinct_field.as_deref().map(|f| self.path(f)),
            sort_order: spec.sort_order,
            limit: spec.limit,
            filters: self.filters(&spec.filters),
            add_fields: spec
                .add_fields
                .iter()
                .map(|(k, v)| (k.clone(), self.expression(v)))
                .collect(),
            facets: spec
                .facets
                .iter()
                .map(|(name, branch)| (name.clone(), self.aggregation(branch)))
                .collect(),
        }
    }

    /// Rewrites `"$Alias"` field references inside an aggregation
    /// expression. `$$variables` and operator keys are left alone.
    pub fn expression(&self, expr: &Value) -> Value {
        match expr {
            Value::String(s) => match s.strip_prefix('$') {
                Some(rest) if !rest.starts_with('$') && !rest.is_empty() => {
                    Value::String(format!("${}", self.schema.canonical(rest)))
                }
                _ => expr.clone(),
            },
            Value::Array(items) => Value::Array(items.iter().map(|i| self.expression(i)).collect()),
            Value::Object(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), self.expression(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn canonicalize(&self, intent: &QueryIntent) -> QueryIntent {
        QueryIntent {
            intent: intent.intent.clone(),
            filters: self.filters(&intent.filters),
            fields: self.fields(&intent.fields),
            aggregation: intent.aggregation.as_ref().map(|a| self.aggregation(a)),
            missing_filters: intent.missing_filters.clone(),
            warnings: intent.warnings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::AggregationKind;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn alias_keys_become_canonical_with_value_preserved() {
        let schema = SchemaDescriptor::alerts().unwrap();
        let mapper = SchemaMapper::new(&schema);
        for (alias, canonical) in schema.aliases() {
            let value = json!({"$gte": 3, "$lt": [1, "x"]});
            let mut filters = Document::new();
            filters.insert(alias.clone(), value.clone());
            let mapped = mapper.filters(&filters);
            assert_eq!(mapped.len(), 1);
            assert_eq!(mapped.get(canonical), Some(&value), "{alias}");
        }
    }

    #[test]
    fn canonicalizing_twice_is_a_no_op() {
        let schema = SchemaDescriptor::device_logs().unwrap();
        let mapper = SchemaMapper::new(&schema);
        let once = mapper.filters(&doc(json!({"DeviceName": "Monitor-7", "LogLevel": "ERROR"})));
        assert_eq!(mapper.filters(&once), once);
        assert!(once.contains_key("LogData.DeviceName"));
    }

    #[test]
    fn logical_branches_are_rekeyed() {
        let schema = SchemaDescriptor::alerts().unwrap();
        let mapper = SchemaMapper::new(&schema);
        let mapped = mapper.filters(&doc(json!({"$or": [{"IdUserId": "u1"}, {"Ward": "ICU"}]})));
        assert_eq!(mapped["$or"], json!([{"_id.UserId": "u1"}, {"Ward": "ICU"}]));
    }

    #[test]
    fn fields_keep_order_and_collapse_computed_entries() {
        let schema = SchemaDescriptor::device_logs().unwrap();
        let mapper = SchemaMapper::new(&schema);
        let fields = vec![
            FieldRef::Path("Model".into()),
            FieldRef::Computed(json!({"day": {"$dateToString": {"date": "$Timestamp"}}})),
            FieldRef::Path("DeviceId".into()),
        ];
        assert_eq!(
            mapper.fields(&fields),
            vec![
                FieldRef::Path("LogData.Model".into()),
                FieldRef::Path("day".into()),
                FieldRef::Path("DeviceId".into()),
            ]
        );
    }

    #[test]
    fn aggregation_subkeys_map_individually() {
        let schema = SchemaDescriptor::alerts().unwrap();
        let mapper = SchemaMapper::new(&schema);
        let mut spec = AggregationSpec::of(AggregationKind::CountDistinct);
        spec.group_by = Some(GroupKey::Path("IdSource".into()));
        spec.distinct_field = Some("IdUserId".into());
        spec.field = Some("ParameterValue".into());
        spec.limit = Some(4);
        let mapped = mapper.aggregation(&spec);
        assert_eq!(mapped.group_by, Some(GroupKey::Path("_id.Source".into())));
        assert_eq!(mapped.distinct_field.as_deref(), Some("_id.UserId"));
        assert_eq!(mapped.field.as_deref(), Some("ParameterValue"));
        assert_eq!(mapped.limit, Some(4));
        assert_eq!(mapped.sort_order, spec.sort_order);
    }

    #[test]
    fn expression_references_are_rewritten() {
        let schema = SchemaDescriptor::device_logs().unwrap();
        let mapper = SchemaMapper::new(&schema);
        let e = mapper.expression(&json!({"$dateToString": {"format": "%Y", "date": "$HeaderTime", "tz": "$$tz"}}));
        assert_eq!(
            e,
            json!({"$dateToString": {"format": "%Y", "date": "$LogData.TagDetail.HeaderTime", "tz": "$$tz"}})
        );
    }
}
