use crate::intent::Document;
use crate::schema::SchemaDescriptor;
use crate::time::{relative_tag, RelativeRange};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Pseudo-filter key the oracle uses for relative windows.
pub const TIME_RANGE_KEY: &str = "timeRange";

fn is_operator_map(m: &Document) -> bool {
    !m.is_empty() && m.keys().all(|k| k.starts_with('$'))
}

/// Folds `"<compound>.<subfield>"` filters into one nested predicate per
/// compound key. Every sub-field addressing the same parent lands in the
/// same object. Keys that do not address a compound key pass through.
pub fn normalize_nested(filters: &Document, schema: &SchemaDescriptor) -> Document {
    let mut out = Document::new();
    let mut nested: BTreeMap<String, Document> = BTreeMap::new();
    for (key, value) in filters {
        match schema.compound_parent(key) {
            Some((parent, sub)) => {
                let slot = nested.entry(parent.to_string()).or_default();
                match (slot.get_mut(sub), value) {
                    (Some(Value::Object(existing)), Value::Object(ops))
                        if is_operator_map(existing) && is_operator_map(ops) =>
                    {
                        existing.extend(ops.clone());
                    }
                    _ => {
                        slot.insert(sub.to_string(), value.clone());
                    }
                }
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    for (parent, subs) in nested {
        match out.get_mut(&parent) {
            Some(Value::Object(existing)) if !is_operator_map(existing) => {
                existing.extend(subs);
            }
            // the parent already carries a non-document predicate; keep the
            // sub-field constraints addressable on their own
            Some(_) => {
                for (sub, v) in subs {
                    out.insert(format!("{parent}.{sub}"), v);
                }
            }
            None => {
                out.insert(parent, Value::Object(subs));
            }
        }
    }
    out
}

/// Replaces a `timeRange` pseudo-filter with a concrete range on the
/// schema's time field. Returns a warning when it cannot be resolved, in
/// which case the pseudo-filter is dropped.
pub fn resolve_time_range(
    filters: &Document,
    schema: &SchemaDescriptor,
    now: DateTime<Utc>,
) -> (Document, Option<String>) {
    let Some(raw) = filters.get(TIME_RANGE_KEY) else {
        return (filters.clone(), None);
    };
    let mut out = filters.clone();
    out.remove(TIME_RANGE_KEY);
    let range = relative_tag(raw).and_then(RelativeRange::parse);
    match (range, schema.time_field()) {
        (Some(range), Some(field)) => {
            if out.contains_key(field) {
                return (
                    out,
                    Some(format!("timeRange ignored: {field} is already constrained")),
                );
            }
            match range.predicate(now) {
                Some(predicate) => {
                    out.insert(field.to_string(), predicate);
                    (out, None)
                }
                None => (out, Some(format!("timeRange {raw} is out of range; dropped"))),
            }
        }
        (None, _) => (out, Some(format!("unrecognised timeRange {raw}; dropped"))),
        (Some(_), None) => (
            out,
            Some(format!("{} has no time field; timeRange dropped", schema.name())),
        ),
    }
}
