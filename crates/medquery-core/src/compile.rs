//! Intent → query compiler.
//!
//! Rules are tried in a fixed priority order and the first that applies
//! wins:
//!
//! 1. `distinct` with a field
//! 2. `count_distinct` with a distinct target (grouped or global)
//! 3. `count` with `group_by`
//! 4. numeric reduction with `group_by` and `field`
//! 5. numeric reduction with `field`
//! 6. `facets` present
//! 7. `["min", "max"]` with `field`, as a two-branch facet
//! 8. `count` without `group_by`, as a plain document count
//! 9. filtered read
//!
//! An intent that names a rule but lacks its components falls through to
//! the next rule that does apply, so every intent compiles to something.

use crate::intent::{AggregationKind, AggregationSpec, Document, FieldRef, GroupKey, QueryIntent};
use crate::mapper::SchemaMapper;
use crate::normalize::{normalize_nested, resolve_time_range};
use crate::pipeline::{CompiledPipeline, CompiledQuery, QueryShape, Stage};
use crate::schema::SchemaDescriptor;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const MIN_BRANCH: &str = "min";
pub const MAX_BRANCH: &str = "max";

pub struct Compiler<'a> {
    schema: &'a SchemaDescriptor,
    now: DateTime<Utc>,
}

impl<'a> Compiler<'a> {
    pub fn new(schema: &'a SchemaDescriptor) -> Self {
        Self {
            schema,
            now: Utc::now(),
        }
    }

    /// Fixes the clock used to resolve relative time ranges.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn compile(&self, intent: &QueryIntent) -> CompiledPipeline {
        let canonical = SchemaMapper::new(self.schema).canonicalize(intent);
        let mut warnings = canonical.warnings.clone();
        let filters = self.prepare_filters(&canonical.filters, &mut warnings);
        let spec = canonical.aggregation.clone().unwrap_or_default();
        let (shape, query) = self.dispatch(&filters, &canonical.fields, &spec, &mut warnings);
        debug!(
            collection = self.schema.collection(),
            shape = %shape,
            query = %query.to_json(),
            "compiled intent"
        );
        CompiledPipeline {
            shape,
            query,
            warnings,
        }
    }

    fn prepare_filters(&self, filters: &Document, warnings: &mut Vec<String>) -> Document {
        let (resolved, warning) = resolve_time_range(filters, self.schema, self.now);
        warnings.extend(warning);
        normalize_nested(&resolved, self.schema)
    }

    fn dispatch(
        &self,
        filters: &Document,
        fields: &[FieldRef],
        spec: &AggregationSpec,
        warnings: &mut Vec<String>,
    ) -> (QueryShape, CompiledQuery) {
        // rules 1-5
        if let Some((shape, body)) = reduction_rules(spec, warnings) {
            let mut pipeline = leading(filters, &spec.add_fields);
            pipeline.extend(body);
            return (shape, CompiledQuery::Aggregate { pipeline });
        }

        // rule 6
        if !spec.facets.is_empty() {
            let mut branches = BTreeMap::new();
            for (name, branch) in &spec.facets {
                match self.branch(name, branch, warnings) {
                    Some(stages) => {
                        branches.insert(name.clone(), stages);
                    }
                    None => warnings.push(format!("facet {name} could not be compiled; skipped")),
                }
            }
            if !branches.is_empty() {
                let mut pipeline = leading(filters, &spec.add_fields);
                pipeline.push(Stage::Facet(branches));
                return (QueryShape::Facet, CompiledQuery::Aggregate { pipeline });
            }
            warnings.push("no facet branch survived compilation".into());
        }

        // rule 7
        if spec.is(&AggregationKind::MinMax) {
            if let Some(field) = &spec.field {
                let mut branches = BTreeMap::new();
                branches.insert(
                    MIN_BRANCH.to_string(),
                    global_reduction(&AggregationKind::Min, field),
                );
                branches.insert(
                    MAX_BRANCH.to_string(),
                    global_reduction(&AggregationKind::Max, field),
                );
                let mut pipeline = leading(filters, &spec.add_fields);
                pipeline.push(Stage::Facet(branches));
                return (QueryShape::MinMax, CompiledQuery::Aggregate { pipeline });
            }
            warnings.push("min/max requires field".into());
        }

        // rule 8
        if spec.is(&AggregationKind::Count) && spec.group_by.is_none() {
            return (
                QueryShape::Count,
                CompiledQuery::Count {
                    filter: filters.clone(),
                },
            );
        }

        // rule 9
        if let Some(kind) = &spec.kind {
            warnings.push(format!("aggregation {kind:?} not compilable; plain read instead"));
        }
        (
            QueryShape::Find,
            CompiledQuery::Find {
                filter: filters.clone(),
                projection: projection(fields),
            },
        )
    }

    /// One `$facet` branch. Only stages legal inside `$facet` are emitted.
    fn branch(
        &self,
        name: &str,
        spec: &AggregationSpec,
        warnings: &mut Vec<String>,
    ) -> Option<Vec<Stage>> {
        if spec.is(&AggregationKind::Facet) || !spec.facets.is_empty() {
            warnings.push(format!("facet {name}: nested facets are not allowed"));
            return None;
        }
        let filters = self.prepare_filters(&spec.filters, warnings);
        let mut stages = leading(&filters, &spec.add_fields);
        let mut scoped = Vec::new();
        let body = if let Some((_, body)) = reduction_rules(spec, &mut scoped) {
            body
        } else if let (true, Some(field)) = (spec.is(&AggregationKind::MinMax), spec.field.as_deref()) {
            let mut group = Document::new();
            group.insert("_id".into(), Value::Null);
            group.insert("minValue".into(), json!({ "$min": coerce(field) }));
            group.insert("maxValue".into(), json!({ "$max": coerce(field) }));
            vec![Stage::Group(group), Stage::Project(doc([("_id", json!(0))]))]
        } else if spec.is(&AggregationKind::Count) {
            vec![Stage::Count(AggregationKind::Count.metric_name().to_string())]
        } else {
            warnings.extend(scoped.into_iter().map(|w| format!("facet {name}: {w}")));
            return None;
        };
        stages.extend(body);
        Some(stages)
    }
}

fn doc<const N: usize>(entries: [(&str, Value); N]) -> Document {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// `$match` and `$addFields` that run before anything else.
fn leading(filters: &Document, add_fields: &Document) -> Vec<Stage> {
    let mut stages = Vec::new();
    if !filters.is_empty() {
        stages.push(Stage::Match(filters.clone()));
    }
    if !add_fields.is_empty() {
        stages.push(Stage::AddFields(add_fields.clone()));
    }
    stages
}

fn field_ref(path: &str) -> Value {
    Value::String(format!("${path}"))
}

fn group_id(key: &GroupKey) -> Value {
    match key {
        GroupKey::Path(p) => field_ref(p),
        GroupKey::Expr(e) => e.clone(),
    }
}

/// Stored values may be numeric strings; reduce over doubles and let
/// anything unconvertible drop out as null.
fn coerce(path: &str) -> Value {
    json!({
        "$convert": {
            "input": field_ref(path),
            "to": "double",
            "onError": null,
            "onNull": null,
        }
    })
}

fn leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// `{_id: 0, <label>: "$_id", ...metrics}`
fn project_group(label: &str, metrics: &[(&str, Value)]) -> Stage {
    let mut p = Document::new();
    if label != "_id" {
        p.insert("_id".into(), json!(0));
    }
    p.insert(label.to_string(), json!("$_id"));
    for (name, v) in metrics {
        p.insert((*name).to_string(), v.clone());
    }
    Stage::Project(p)
}

fn sort_by(key: &str, spec: &AggregationSpec) -> Stage {
    Stage::Sort(doc([(key, json!(spec.sort_order.direction()))]))
}

fn push_limit(stages: &mut Vec<Stage>, spec: &AggregationSpec) {
    // an absent limit means every group
    if let Some(n) = spec.limit {
        stages.push(Stage::Limit(n));
    }
}

fn global_reduction(kind: &AggregationKind, field: &str) -> Vec<Stage> {
    let metric = kind.metric_name();
    let op = kind.reduction_operator().unwrap_or("$sum");
    let mut group = Document::new();
    group.insert("_id".into(), Value::Null);
    group.insert(metric.into(), json!({ op: coerce(field) }));
    vec![
        Stage::Group(group),
        Stage::Project(doc([("_id", json!(0)), (metric, json!(1))])),
    ]
}

/// Rules 1-5. Returns the stages that follow the leading `$match`.
fn reduction_rules(
    spec: &AggregationSpec,
    warnings: &mut Vec<String>,
) -> Option<(QueryShape, Vec<Stage>)> {
    let kind = spec.kind.as_ref()?;

    // 1. distinct
    if *kind == AggregationKind::Distinct {
        match &spec.field {
            Some(field) => {
                let label = leaf(field);
                let mut stages = vec![
                    Stage::Group(doc([("_id", field_ref(field))])),
                    Stage::Sort(doc([("_id", json!(spec.sort_order.direction()))])),
                ];
                push_limit(&mut stages, spec);
                stages.push(project_group(label, &[]));
                return Some((QueryShape::Distinct, stages));
            }
            None => warnings.push("distinct requires field".into()),
        }
    }

    // 2. count_distinct
    if *kind == AggregationKind::CountDistinct {
        let target = spec.distinct_field.as_deref().or(spec.field.as_deref());
        match (target, &spec.group_by) {
            (Some(target), Some(group_by)) => {
                let mut stages = vec![
                    Stage::Group(doc([
                        ("_id", group_id(group_by)),
                        ("uniqueValues", json!({ "$addToSet": field_ref(target) })),
                    ])),
                    project_group(
                        &group_by.label(),
                        &[("distinctCount", json!({ "$size": "$uniqueValues" }))],
                    ),
                    sort_by("distinctCount", spec),
                ];
                push_limit(&mut stages, spec);
                return Some((QueryShape::CountDistinct, stages));
            }
            (Some(target), None) => {
                return Some((
                    QueryShape::CountDistinct,
                    vec![
                        Stage::Group(doc([
                            ("_id", Value::Null),
                            ("uniqueValues", json!({ "$addToSet": field_ref(target) })),
                        ])),
                        Stage::Project(doc([
                            ("_id", json!(0)),
                            ("distinctCount", json!({ "$size": "$uniqueValues" })),
                        ])),
                    ],
                ));
            }
            (None, _) => warnings.push("count_distinct requires distinct_field or field".into()),
        }
    }

    // 3. grouped count
    if *kind == AggregationKind::Count {
        if let Some(group_by) = &spec.group_by {
            let metric = kind.metric_name();
            let mut stages = vec![
                Stage::Group(doc([("_id", group_id(group_by)), (metric, json!({ "$sum": 1 }))])),
                sort_by(metric, spec),
            ];
            push_limit(&mut stages, spec);
            stages.push(project_group(&group_by.label(), &[(metric, json!(1))]));
            return Some((QueryShape::GroupedCount, stages));
        }
    }

    // 4 & 5. numeric reductions
    if let Some(op) = kind.reduction_operator() {
        let Some(field) = &spec.field else {
            warnings.push(format!("{} requires field", kind.metric_name()));
            return None;
        };
        let metric = kind.metric_name();
        return Some(match &spec.group_by {
            Some(group_by) => {
                let mut stages = vec![
                    Stage::Group(doc([
                        ("_id", group_id(group_by)),
                        (metric, json!({ op: coerce(field) })),
                    ])),
                    sort_by(metric, spec),
                ];
                push_limit(&mut stages, spec);
                stages.push(project_group(&group_by.label(), &[(metric, json!(1))]));
                (QueryShape::GroupedReduction, stages)
            }
            None => (QueryShape::Reduction, global_reduction(kind, field)),
        });
    }

    None
}

/// `{field: 1, ...}` for the requested fields, hiding `_id` unless asked
/// for. `None` means every field.
fn projection(fields: &[FieldRef]) -> Option<Document> {
    if fields.is_empty() {
        return None;
    }
    let names: Vec<String> = fields.iter().map(FieldRef::display_name).collect();
    let mut p = Document::new();
    for name in &names {
        // a parent path already covers its children
        let covered = names
            .iter()
            .any(|other| other != name && name.starts_with(&format!("{other}.")));
        if !covered {
            p.insert(name.clone(), json!(1));
        }
    }
    let wants_id = names.iter().any(|n| n == "_id" || n.starts_with("_id."));
    if !wants_id {
        p.insert("_id".into(), json!(0));
    }
    Some(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alerts() -> SchemaDescriptor {
        SchemaDescriptor::alerts().unwrap()
    }

    fn compile(schema: &SchemaDescriptor, v: Value) -> CompiledPipeline {
        Compiler::new(schema).compile(&QueryIntent::from_value(&v).unwrap())
    }

    fn stages_json(c: &CompiledPipeline) -> Value {
        crate::pipeline::pipeline_json(c.query.stages())
    }

    #[test]
    fn grouped_count_without_limit_has_no_limit_stage() {
        let c = compile(&alerts(), json!({"aggregation": {"type": "count", "group_by": "Ward"}}));
        assert_eq!(c.shape, QueryShape::GroupedCount);
        assert!(c.query.stages().iter().all(|s| !matches!(s, Stage::Limit(_))));
    }

    #[test]
    fn grouped_count_with_limit_puts_it_after_sort() {
        let c = compile(
            &alerts(),
            json!({"aggregation": {"type": "count", "group_by": "Ward", "limit": 1}}),
        );
        let stages = c.query.stages();
        let limits: Vec<usize> = stages
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, Stage::Limit(1)).then_some(i))
            .collect();
        assert_eq!(limits.len(), 1);
        let sort = stages.iter().position(|s| matches!(s, Stage::Sort(_))).unwrap();
        assert!(sort < limits[0]);
    }

    #[test]
    fn ward_question_compiles_to_expected_pipeline() {
        let c = compile(
            &alerts(),
            json!({
                "intent": "aggregate",
                "filters": {"OrganizationId": "OrgX"},
                "fields": ["Ward"],
                "aggregation": {"type": "count", "group_by": "Ward", "sort_order": "desc", "limit": 1}
            }),
        );
        assert_eq!(
            stages_json(&c),
            json!([
                {"$match": {"OrganizationId": "OrgX"}},
                {"$group": {"_id": "$Ward", "count": {"$sum": 1}}},
                {"$sort": {"count": -1}},
                {"$limit": 1},
                {"$project": {"_id": 0, "Ward": "$_id", "count": 1}}
            ])
        );
        assert_eq!(c.query.execution_type(), "aggregate");
    }

    #[test]
    fn sort_direction_defaults_to_ascending() {
        for order in [json!("asc"), json!("ascending"), json!(null), json!(7)] {
            let c = compile(
                &alerts(),
                json!({"aggregation": {"type": "count", "group_by": "Status", "sort_order": order}}),
            );
            assert!(c.query.stages().contains(&Stage::Sort(doc([("count", json!(1))]))));
        }
        let c = compile(
            &alerts(),
            json!({"aggregation": {"type": "count", "group_by": "Status"}}),
        );
        assert!(c.query.stages().contains(&Stage::Sort(doc([("count", json!(1))]))));
    }

    #[test]
    fn distinct_groups_and_projects_flat_values() {
        let schema = SchemaDescriptor::device_logs().unwrap();
        let c = compile(&schema, json!({"aggregation": {"type": "distinct", "field": "DeviceType"}}));
        assert_eq!(c.shape, QueryShape::Distinct);
        assert_eq!(
            stages_json(&c),
            json!([
                {"$group": {"_id": "$LogData.DeviceType"}},
                {"$sort": {"_id": 1}},
                {"$project": {"_id": 0, "DeviceType": "$_id"}}
            ])
        );
    }

    #[test]
    fn distinct_without_field_falls_through() {
        let c = compile(&alerts(), json!({"fields": ["Ward"], "aggregation": {"type": "distinct"}}));
        assert_eq!(c.shape, QueryShape::Find);
        assert!(c.warnings.iter().any(|w| w.contains("distinct requires field")));
    }

    #[test]
    fn count_distinct_grouped_sorts_by_cardinality() {
        let c = compile(
            &alerts(),
            json!({"aggregation": {
                "type": "count_distinct", "group_by": "Ward", "distinct_field": "DeviceId", "sort_order": "desc"
            }}),
        );
        assert_eq!(c.shape, QueryShape::CountDistinct);
        assert_eq!(
            stages_json(&c),
            json!([
                {"$group": {"_id": "$Ward", "uniqueValues": {"$addToSet": "$DeviceId"}}},
                {"$project": {"_id": 0, "Ward": "$_id", "distinctCount": {"$size": "$uniqueValues"}}},
                {"$sort": {"distinctCount": -1}}
            ])
        );
    }

    #[test]
    fn count_distinct_without_group_is_global() {
        let c = compile(
            &alerts(),
            json!({"filters": {"OrganizationId": "OrgX"}, "aggregation": {"type": "count_distinct", "field": "DeviceId"}}),
        );
        assert_eq!(c.shape, QueryShape::CountDistinct);
        assert_eq!(
            stages_json(&c),
            json!([
                {"$match": {"OrganizationId": "OrgX"}},
                {"$group": {"_id": null, "uniqueValues": {"$addToSet": "$DeviceId"}}},
                {"$project": {"_id": 0, "distinctCount": {"$size": "$uniqueValues"}}}
            ])
        );
    }

    #[test]
    fn grouped_average_coerces_before_reducing() {
        let c = compile(
            &alerts(),
            json!({"aggregation": {"type": "avg", "group_by": "Ward", "field": "ParameterValue", "sort_order": "desc"}}),
        );
        assert_eq!(c.shape, QueryShape::GroupedReduction);
        let group = &stages_json(&c)[0]["$group"];
        assert_eq!(group["average"]["$avg"]["$convert"]["input"], json!("$ParameterValue"));
        assert_eq!(group["average"]["$avg"]["$convert"]["to"], json!("double"));
    }

    #[test]
    fn min_without_group_is_single_global_reduction() {
        let c = compile(
            &alerts(),
            json!({"filters": {"ParameterKey": "BP"}, "aggregation": {"type": "min", "field": "ParameterValue"}}),
        );
        assert_eq!(c.shape, QueryShape::Reduction);
        let stages = stages_json(&c);
        assert_eq!(stages[1]["$group"]["_id"], Value::Null);
        assert!(stages[1]["$group"]["minValue"]["$min"]["$convert"].is_object());
        assert_eq!(stages[2], json!({"$project": {"_id": 0, "minValue": 1}}));
    }

    #[test]
    fn min_max_list_is_one_two_branch_facet() {
        let c = compile(
            &alerts(),
            json!({"filters": {"ParameterKey": "HR"}, "aggregation": {"type": ["min", "max"], "field": "ParameterValue"}}),
        );
        assert_eq!(c.shape, QueryShape::MinMax);
        let stages = c.query.stages();
        assert_eq!(stages.len(), 2);
        match &stages[1] {
            Stage::Facet(branches) => {
                assert_eq!(branches.len(), 2);
                assert!(branches.contains_key(MIN_BRANCH));
                assert!(branches.contains_key(MAX_BRANCH));
            }
            other => panic!("expected facet, got {other:?}"),
        }
    }

    #[test]
    fn facet_shares_filters_and_derived_fields() {
        let c = compile(
            &alerts(),
            json!({
                "filters": {"OrganizationId": "OrgY"},
                "aggregation": {
                    "type": "facet",
                    "add_fields": {"parsedTimestamp": {"$toDate": "$Timestamp"}},
                    "facets": {
                        "dailyAlertTrend": [{"type": "count", "group_by": {"$dateToString": {"format": "%Y-%m-%d", "date": "$parsedTimestamp"}}}],
                        "topWard": {"type": "count", "group_by": "Ward", "sort_order": "desc", "limit": 1},
                        "critical": {"type": "count", "filters": {"Status": "Critical"}}
                    }
                }
            }),
        );
        assert_eq!(c.shape, QueryShape::Facet);
        let stages = stages_json(&c);
        assert_eq!(stages[0], json!({"$match": {"OrganizationId": "OrgY"}}));
        assert_eq!(stages[1], json!({"$addFields": {"parsedTimestamp": {"$toDate": "$Timestamp"}}}));
        let facet = &stages[2]["$facet"];
        assert_eq!(
            facet["dailyAlertTrend"][0]["$group"]["_id"],
            json!({"$dateToString": {"format": "%Y-%m-%d", "date": "$parsedTimestamp"}})
        );
        assert_eq!(facet["dailyAlertTrend"][2], json!({"$project": {"_id": 0, "date": "$_id", "count": 1}}));
        assert_eq!(facet["topWard"][2], json!({"$limit": 1}));
        assert_eq!(
            facet["critical"],
            json!([{"$match": {"Status": "Critical"}}, {"$count": "count"}])
        );
    }

    #[test]
    fn nested_facet_branch_is_skipped() {
        let c = compile(
            &alerts(),
            json!({"aggregation": {"type": "facet", "facets": {
                "ok": {"type": "max", "field": "ParameterValue"},
                "bad": {"type": "facet", "facets": {"x": {"type": "count"}}}
            }}}),
        );
        assert_eq!(c.shape, QueryShape::Facet);
        match &c.query.stages()[0] {
            Stage::Facet(b) => assert_eq!(b.keys().collect::<Vec<_>>(), vec!["ok"]),
            other => panic!("expected facet, got {other:?}"),
        }
        assert!(c.warnings.iter().any(|w| w.contains("bad")));
    }

    #[test]
    fn facet_with_no_usable_branch_falls_through() {
        let c = compile(
            &alerts(),
            json!({"aggregation": {"type": "facet", "facets": {"x": {"type": "avg"}}}}),
        );
        assert_eq!(c.shape, QueryShape::Find);
    }

    #[test]
    fn plain_count_bypasses_the_pipeline() {
        let c = compile(
            &alerts(),
            json!({"filters": {"OrganizationId": "OrgX", "IdUserId": "p1"}, "aggregation": {"type": "count"}}),
        );
        assert_eq!(c.shape, QueryShape::Count);
        assert_eq!(
            c.query,
            CompiledQuery::Count {
                filter: json!({"OrganizationId": "OrgX", "_id": {"UserId": "p1"}})
                    .as_object()
                    .cloned()
                    .unwrap()
            }
        );
        assert_eq!(c.query.execution_type(), "count_documents");
    }

    #[test]
    fn fallback_read_projects_only_requested_fields() {
        let c = compile(&alerts(), json!({"fields": ["DeviceId"], "aggregation": null}));
        assert_eq!(c.shape, QueryShape::Find);
        assert_eq!(
            c.query,
            CompiledQuery::Find {
                filter: Document::new(),
                projection: Some(doc([("DeviceId", json!(1)), ("_id", json!(0))])),
            }
        );
    }

    #[test]
    fn fallback_read_without_fields_projects_everything() {
        let c = compile(&alerts(), json!({"filters": {"Ward": "ICU"}}));
        assert_eq!(
            c.query,
            CompiledQuery::Find {
                filter: doc([("Ward", json!("ICU"))]),
                projection: None,
            }
        );
    }

    #[test]
    fn projection_keeps_id_when_requested_and_drops_covered_children() {
        let schema = SchemaDescriptor::device_logs().unwrap();
        let c = compile(&schema, json!({"fields": ["_id", "LogData", "DeviceName"]}));
        match c.query {
            CompiledQuery::Find { projection: Some(p), .. } => {
                assert_eq!(Value::Object(p), json!({"_id": 1, "LogData": 1}));
            }
            other => panic!("expected find, got {other:?}"),
        }
    }

    #[test]
    fn unknown_aggregation_type_degrades_to_read() {
        let c = compile(&alerts(), json!({"aggregation": {"type": "median", "field": "ParameterValue"}}));
        assert_eq!(c.shape, QueryShape::Find);
        assert!(!c.warnings.is_empty());
    }

    #[test]
    fn compiled_json_carries_type_and_shape() {
        let c = compile(&alerts(), json!({"aggregation": {"type": "count"}}));
        let v = c.to_json();
        assert_eq!(v["type"], json!("count_documents"));
        assert_eq!(v["shape"], json!("count"));
    }

    #[test]
    fn oversized_relative_ranges_compile_without_a_time_filter() {
        for relative in ["last_100000000_days", "last_999999999_weeks", "last_4294967295_hours"] {
            let c = compile(
                &alerts(),
                json!({
                    "filters": {"Ward": "B", "timeRange": {"relative": relative}},
                    "aggregation": {"type": "count"}
                }),
            );
            assert_eq!(c.shape, QueryShape::Count);
            assert_eq!(
                c.query,
                CompiledQuery::Count {
                    filter: json!({"Ward": "B"}).as_object().cloned().unwrap()
                }
            );
            assert!(
                c.warnings.iter().any(|w| w.contains("timeRange")),
                "{relative}: {:?}",
                c.warnings
            );
        }
    }
}
