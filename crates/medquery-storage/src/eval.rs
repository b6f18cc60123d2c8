//! Aggregation-pipeline evaluator over JSON documents.
//!
//! Covers the operators the compiler emits plus the common ones an oracle
//! tends to put in filters. Anything else is rejected as a store error,
//! the way a real server rejects an invalid pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use medquery_core::{Document, QueryError, Result};
use regex::RegexBuilder;
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;

fn store_err(msg: impl Into<String>) -> QueryError {
    QueryError::Store(msg.into())
}

pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut cur = doc.get(parts.next()?)?;
    for p in parts {
        cur = cur.as_object()?.get(p)?;
    }
    Some(cur)
}

fn set_path(doc: &mut Document, path: &str, v: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), v);
        }
        Some((head, rest)) => {
            let slot = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                set_path(inner, rest, v);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

// ---- comparison ----

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order used by `$sort`, `$min` and `$max`: values of different
/// types order by type, then by value.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => num_cmp(x, y),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y) {
                let o = sort_cmp(Some(l), Some(r));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let o = lk.cmp(rk).then_with(|| sort_cmp(Some(lv), Some(rv)));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn num_cmp(x: &Number, y: &Number) -> Ordering {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => {
            let (a, b) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
    }
}

/// Equality with numeric widening (`9 == 9.0`) and embedded-document
/// equality for objects.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => num_cmp(x, y) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Applies `pred` to a value, or to each element when the stored value is
/// an array.
fn any_element(actual: Option<&Value>, pred: impl Fn(Option<&Value>) -> bool) -> bool {
    match actual {
        Some(Value::Array(items)) => pred(actual) || items.iter().any(|i| pred(Some(i))),
        other => pred(other),
    }
}

fn eq_match(actual: Option<&Value>, expected: &Value) -> bool {
    any_element(actual, |v| match (v, expected) {
        (None, Value::Null) => true,
        (Some(v), e) => values_equal(v, e),
        (None, _) => false,
    })
}

/// Ordered comparison only between values of the same type.
fn range_match(actual: Option<&Value>, bound: &Value, accept: fn(Ordering) -> bool) -> bool {
    any_element(actual, |v| match v {
        Some(v) if type_rank(Some(v)) == type_rank(Some(bound)) && !v.is_null() => {
            accept(sort_cmp(Some(v), Some(bound)))
        }
        _ => false,
    })
}

// ---- filters ----

fn is_operator_map(v: &Value) -> bool {
    matches!(v, Value::Object(m) if !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let branches = cond
                    .as_array()
                    .ok_or_else(|| store_err(format!("{key} requires an array")))?;
                let mut results = Vec::with_capacity(branches.len());
                for b in branches {
                    let b = b
                        .as_object()
                        .ok_or_else(|| store_err(format!("{key} entries must be documents")))?;
                    results.push(matches(doc, b)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            k if k.starts_with('$') => {
                return Err(store_err(format!("unknown top level operator: {k}")));
            }
            path => {
                let actual = lookup(doc, path);
                match cond {
                    Value::Object(ops) if is_operator_map(cond) => match_ops(actual, ops)?,
                    other => eq_match(actual, other),
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_ops(actual: Option<&Value>, ops: &Document) -> Result<bool> {
    for (op, val) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_match(actual, val),
            "$ne" => !eq_match(actual, val),
            "$gt" => range_match(actual, val, |o| o == Ordering::Greater),
            "$gte" => range_match(actual, val, |o| o != Ordering::Less),
            "$lt" => range_match(actual, val, |o| o == Ordering::Less),
            "$lte" => range_match(actual, val, |o| o != Ordering::Greater),
            "$in" | "$nin" => {
                let set = val
                    .as_array()
                    .ok_or_else(|| store_err(format!("{op} needs an array")))?;
                let hit = set.iter().any(|e| eq_match(actual, e));
                if op == "$in" {
                    hit
                } else {
                    !hit
                }
            }
            "$exists" => {
                let want = match val {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
                    _ => true,
                };
                actual.is_some() == want
            }
            "$regex" => {
                let pattern = val
                    .as_str()
                    .ok_or_else(|| store_err("$regex needs a string pattern"))?;
                let opts = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(opts.contains('i'))
                    .multi_line(opts.contains('m'))
                    .dot_matches_new_line(opts.contains('s'))
                    .build()
                    .map_err(|e| store_err(format!("invalid $regex: {e}")))?;
                any_element(actual, |v| matches!(v, Some(Value::String(s)) if re.is_match(s)))
            }
            "$options" => true,
            "$not" => {
                let inner = val
                    .as_object()
                    .ok_or_else(|| store_err("$not needs an operator document"))?;
                !match_ops(actual, inner)?
            }
            other => return Err(store_err(format!("unknown operator: {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---- expressions ----

/// Accepts both `{"$op": x}` and `{"$op": [x]}`.
fn unary(arg: &Value) -> &Value {
    match arg {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

pub fn parse_datetime(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn date_json(dt: DateTime<Utc>) -> Value {
    Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

fn to_double(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn f64_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn to_string_value(v: &Value) -> Option<Value> {
    match v {
        Value::Null => Some(Value::Null),
        Value::String(_) => Some(v.clone()),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

fn convert(input: &Value, to: &str) -> Option<Value> {
    match to {
        "double" | "decimal" => to_double(input).map(f64_json),
        "int" | "long" => to_double(input)
            .filter(|f| f.fract() == 0.0)
            .map(|f| json!(f as i64)),
        "string" => to_string_value(input),
        "date" => parse_datetime(input).map(date_json),
        "bool" => Some(Value::Bool(match input {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => true,
        })),
        _ => None,
    }
}

pub fn eval(doc: &Document, expr: &Value) -> Result<Value> {
    match expr {
        Value::String(s) if s == "$$ROOT" => Ok(Value::Object(doc.clone())),
        Value::String(s) if s.starts_with("$$") => Err(store_err(format!("unknown variable {s}"))),
        Value::String(s) if s.starts_with('$') => {
            Ok(lookup(doc, &s[1..]).cloned().unwrap_or(Value::Null))
        }
        Value::Array(items) => items
            .iter()
            .map(|i| eval(doc, i))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(m) if m.len() == 1 && m.keys().all(|k| k.starts_with('$')) => {
            let (op, arg) = m.iter().next().ok_or_else(|| store_err("empty expression"))?;
            eval_operator(doc, op, arg)
        }
        Value::Object(m) => {
            let mut out = Document::new();
            for (k, v) in m {
                if k.starts_with('$') {
                    return Err(store_err(format!("unexpected operator {k} in expression")));
                }
                out.insert(k.clone(), eval(doc, v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn eval_operator(doc: &Document, op: &str, arg: &Value) -> Result<Value> {
    match op {
        "$literal" => Ok(arg.clone()),
        "$toDouble" => {
            let v = eval(doc, unary(arg))?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            to_double(&v)
                .map(f64_json)
                .ok_or_else(|| store_err(format!("$toDouble: cannot convert {v}")))
        }
        "$toString" => {
            let v = eval(doc, unary(arg))?;
            to_string_value(&v).ok_or_else(|| store_err(format!("$toString: cannot convert {v}")))
        }
        "$toDate" => {
            let v = eval(doc, unary(arg))?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            parse_datetime(&v)
                .map(date_json)
                .ok_or_else(|| store_err(format!("$toDate: cannot convert {v}")))
        }
        "$size" => match eval(doc, unary(arg))? {
            Value::Array(items) => Ok(json!(items.len())),
            other => Err(store_err(format!("$size requires an array, got {other}"))),
        },
        "$convert" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| store_err("$convert needs a document"))?;
            let input = eval(doc, spec.get("input").unwrap_or(&Value::Null))?;
            let to = spec
                .get("to")
                .and_then(Value::as_str)
                .ok_or_else(|| store_err("$convert needs a string 'to'"))?;
            if input.is_null() {
                return Ok(spec.get("onNull").cloned().unwrap_or(Value::Null));
            }
            match convert(&input, to) {
                Some(v) => Ok(v),
                None => spec
                    .get("onError")
                    .cloned()
                    .ok_or_else(|| store_err(format!("$convert: cannot convert {input} to {to}"))),
            }
        }
        "$dateToString" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| store_err("$dateToString needs a document"))?;
            if let Some(tz) = spec.get("timezone").and_then(Value::as_str) {
                if !tz.eq_ignore_ascii_case("UTC") && tz != "Z" {
                    return Err(store_err(format!("$dateToString: unsupported timezone {tz}")));
                }
            }
            let date = eval(doc, spec.get("date").unwrap_or(&Value::Null))?;
            if date.is_null() {
                return Ok(spec.get("onNull").cloned().unwrap_or(Value::Null));
            }
            let dt = parse_datetime(&date)
                .ok_or_else(|| store_err(format!("$dateToString: not a date: {date}")))?;
            let format = spec
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("%Y-%m-%dT%H:%M:%S.%LZ")
                .replace("%L", "%3f");
            Ok(Value::String(dt.format(&format).to_string()))
        }
        other => Err(store_err(format!("unsupported expression operator {other}"))),
    }
}

// ---- stages ----

pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Value]) -> Result<Vec<Document>> {
    for stage in pipeline {
        docs = run_stage(docs, stage, false)?;
    }
    Ok(docs)
}

fn run_stage(docs: Vec<Document>, stage: &Value, in_facet: bool) -> Result<Vec<Document>> {
    let m = stage
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| store_err(format!("a pipeline stage must have exactly one field: {stage}")))?;
    let (name, spec) = m.iter().next().ok_or_else(|| store_err("empty stage"))?;
    match name.as_str() {
        "$match" => {
            let filter = spec
                .as_object()
                .ok_or_else(|| store_err("$match needs a document"))?;
            let mut out = Vec::new();
            for d in docs {
                if matches(&d, filter)? {
                    out.push(d);
                }
            }
            Ok(out)
        }
        "$addFields" | "$set" => {
            let fields = spec
                .as_object()
                .ok_or_else(|| store_err(format!("{name} needs a document")))?;
            docs.into_iter()
                .map(|mut d| -> Result<Document> {
                    for (k, expr) in fields {
                        let v = eval(&d, expr)?;
                        set_path(&mut d, k, v);
                    }
                    Ok(d)
                })
                .collect()
        }
        "$group" => group(&docs, spec),
        "$sort" => {
            let keys = spec
                .as_object()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| store_err("$sort needs a non-empty document"))?;
            let mut order = Vec::with_capacity(keys.len());
            for (k, dir) in keys {
                match dir.as_i64() {
                    Some(1) => order.push((k.clone(), false)),
                    Some(-1) => order.push((k.clone(), true)),
                    _ => return Err(store_err(format!("$sort direction for {k} must be 1 or -1"))),
                }
            }
            let mut docs = docs;
            docs.sort_by(|a, b| {
                for (k, desc) in &order {
                    let o = sort_cmp(lookup(a, k), lookup(b, k));
                    let o = if *desc { o.reverse() } else { o };
                    if o != Ordering::Equal {
                        return o;
                    }
                }
                Ordering::Equal
            });
            Ok(docs)
        }
        "$limit" => {
            let n = spec
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| store_err("$limit must be a positive integer"))?;
            Ok(docs.into_iter().take(n as usize).collect())
        }
        "$skip" => {
            let n = spec
                .as_u64()
                .ok_or_else(|| store_err("$skip must be a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$project" => {
            let projection = spec
                .as_object()
                .ok_or_else(|| store_err("$project needs a document"))?;
            docs.iter().map(|d| project(d, projection)).collect()
        }
        "$count" => {
            let field = spec
                .as_str()
                .filter(|s| !s.is_empty() && !s.starts_with('$') && !s.contains('.'))
                .ok_or_else(|| store_err("$count needs a plain field name"))?;
            if docs.is_empty() {
                return Ok(vec![]);
            }
            let mut d = Document::new();
            d.insert(field.to_string(), json!(docs.len()));
            Ok(vec![d])
        }
        "$facet" => {
            if in_facet {
                return Err(store_err("$facet is not allowed inside $facet"));
            }
            let branches = spec
                .as_object()
                .ok_or_else(|| store_err("$facet needs a document"))?;
            let mut out = Document::new();
            for (branch, stages) in branches {
                let stages = stages
                    .as_array()
                    .ok_or_else(|| store_err(format!("$facet branch {branch} must be an array")))?;
                let mut rows = docs.clone();
                for s in stages {
                    rows = run_stage(rows, s, true)?;
                }
                out.insert(
                    branch.clone(),
                    Value::Array(rows.into_iter().map(Value::Object).collect()),
                );
            }
            Ok(vec![out])
        }
        other => Err(store_err(format!("unrecognized pipeline stage name: {other}"))),
    }
}

fn truthy_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

/// `$project` and find projections: inclusion, exclusion, or computed
/// fields. Inclusion and exclusion may not be mixed except for `_id`.
pub fn project(doc: &Document, projection: &Document) -> Result<Document> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut computed = Vec::new();
    let mut keep_id = true;
    for (k, v) in projection {
        match (k.as_str(), truthy_flag(v)) {
            ("_id", Some(flag)) => keep_id = flag,
            (_, Some(true)) => include.push(k.as_str()),
            (_, Some(false)) => exclude.push(k.as_str()),
            (_, None) => computed.push((k.as_str(), v)),
        }
    }
    if !exclude.is_empty() && (!include.is_empty() || !computed.is_empty()) {
        return Err(store_err("cannot mix inclusion and exclusion in a projection"));
    }
    if include.is_empty() && computed.is_empty() {
        let mut out = doc.clone();
        for k in exclude {
            remove_path(&mut out, k);
        }
        if !keep_id {
            out.remove("_id");
        }
        return Ok(out);
    }
    let mut out = Document::new();
    if keep_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".into(), id.clone());
        }
    }
    for (k, v) in projection {
        if k == "_id" && truthy_flag(v).is_some() {
            continue;
        }
        if include.contains(&k.as_str()) {
            if let Some(found) = lookup(doc, k) {
                set_path(&mut out, k, found.clone());
            }
        } else if let Some((_, expr)) = computed.iter().find(|(name, _)| *name == k.as_str()) {
            let value = eval(doc, expr)?;
            set_path(&mut out, k, value);
        }
    }
    Ok(out)
}

enum Acc {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    AddToSet(Vec<Value>),
    Push(Vec<Value>),
    First(Option<Value>),
    Last(Value),
    Count(u64),
}

impl Acc {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Acc::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            "$avg" => Acc::Avg { total: 0.0, n: 0 },
            "$min" => Acc::Min(None),
            "$max" => Acc::Max(None),
            "$addToSet" => Acc::AddToSet(Vec::new()),
            "$push" => Acc::Push(Vec::new()),
            "$first" => Acc::First(None),
            "$last" => Acc::Last(Value::Null),
            "$count" => Acc::Count(0),
            other => return Err(store_err(format!("unknown group operator {other}"))),
        })
    }

    fn add(&mut self, v: Value) {
        match self {
            Acc::Sum {
                int,
                float,
                is_float,
            } => {
                if let Value::Number(n) = &v {
                    match n.as_i64() {
                        Some(i) if !*is_float => *int += i,
                        _ => {
                            if !*is_float {
                                *float = *int as f64;
                                *is_float = true;
                            }
                            *float += n.as_f64().unwrap_or(0.0);
                        }
                    }
                }
            }
            Acc::Avg { total, n } => {
                if let Value::Number(x) = &v {
                    *total += x.as_f64().unwrap_or(0.0);
                    *n += 1;
                }
            }
            Acc::Min(cur) => {
                if !v.is_null()
                    && cur
                        .as_ref()
                        .map(|c| sort_cmp(Some(&v), Some(c)) == Ordering::Less)
                        .unwrap_or(true)
                {
                    *cur = Some(v);
                }
            }
            Acc::Max(cur) => {
                if !v.is_null()
                    && cur
                        .as_ref()
                        .map(|c| sort_cmp(Some(&v), Some(c)) == Ordering::Greater)
                        .unwrap_or(true)
                {
                    *cur = Some(v);
                }
            }
            Acc::AddToSet(set) => {
                // missing values resolve to null and are not collected
                if !v.is_null() && !set.iter().any(|s| values_equal(s, &v)) {
                    set.push(v);
                }
            }
            Acc::Push(items) => items.push(v),
            Acc::First(cur) => {
                if cur.is_none() {
                    *cur = Some(v);
                }
            }
            Acc::Last(cur) => *cur = v,
            Acc::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> Value {
        match self {
            Acc::Sum {
                int,
                float,
                is_float,
            } => {
                if is_float {
                    f64_json(float)
                } else {
                    json!(int)
                }
            }
            Acc::Avg { total, n } => {
                if n == 0 {
                    Value::Null
                } else {
                    f64_json(total / n as f64)
                }
            }
            Acc::Min(v) | Acc::Max(v) | Acc::First(v) => v.unwrap_or(Value::Null),
            Acc::AddToSet(items) | Acc::Push(items) => Value::Array(items),
            Acc::Last(v) => v,
            Acc::Count(n) => json!(n),
        }
    }
}

fn group(docs: &[Document], spec: &Value) -> Result<Vec<Document>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| store_err("$group needs a document"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| store_err("a group specification must include an _id"))?;
    let mut accs: Vec<(&str, &str, &Value)> = Vec::new();
    for (name, acc) in spec {
        if name == "_id" {
            continue;
        }
        let (op, arg) = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| store_err(format!("group field {name} must be an accumulator object")))?;
        accs.push((name.as_str(), op.as_str(), arg));
    }

    // keys compare like MongoDB: 9 and 9.0 share a group, as do embedded
    // documents with reordered fields
    let mut groups: Vec<(Value, Vec<Acc>)> = Vec::new();
    for d in docs {
        let key = eval(d, id_expr)?;
        let slot = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(i) => i,
            None => {
                let fresh = accs
                    .iter()
                    .map(|(_, op, _)| Acc::new(op))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, fresh));
                groups.len() - 1
            }
        };
        for ((_, _, arg), acc) in accs.iter().zip(groups[slot].1.iter_mut()) {
            acc.add(eval(d, arg)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, values)| {
            let mut out = Document::new();
            out.insert("_id".into(), key);
            for ((name, _, _), acc) in accs.iter().zip(values) {
                out.insert((*name).to_string(), acc.finish());
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(v: Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_object().cloned().unwrap())
            .collect()
    }

    fn filter(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn run(data: Value, pipeline: Value) -> Result<Value> {
        let out = run_pipeline(docs(data), pipeline.as_array().unwrap())?;
        Ok(Value::Array(out.into_iter().map(Value::Object).collect()))
    }

    #[test]
    fn embedded_document_equality_on_compound_id() {
        let d = filter(json!({"_id": {"UserId": "u1", "Source": 2}, "Ward": "ICU"}));
        assert!(matches(&d, &filter(json!({"_id": {"Source": 2, "UserId": "u1"}}))).unwrap());
        assert!(!matches(&d, &filter(json!({"_id": {"UserId": "u1"}}))).unwrap());
        assert!(matches(&d, &filter(json!({"_id.UserId": "u1"}))).unwrap());
    }

    #[test]
    fn comparison_operators_respect_types() {
        let d = filter(json!({"v": 10, "t": "2024-09-05T10:00:00Z", "tags": ["a", "b"]}));
        assert!(matches(&d, &filter(json!({"v": {"$gt": 9.5, "$lte": 10}}))).unwrap());
        assert!(!matches(&d, &filter(json!({"v": {"$gt": "9"}}))).unwrap());
        assert!(matches(
            &d,
            &filter(json!({"t": {"$gte": "2024-09-04T00:00:00", "$lte": "2024-09-11T23:59:59.999999"}}))
        )
        .unwrap());
        assert!(matches(&d, &filter(json!({"tags": "b"}))).unwrap());
        assert!(matches(&d, &filter(json!({"missing": null}))).unwrap());
        assert!(matches(&d, &filter(json!({"missing": {"$exists": false}}))).unwrap());
    }

    #[test]
    fn logical_and_regex_operators() {
        let d = filter(json!({"Ward": "ICU-North", "Status": "Open"}));
        assert!(matches(&d, &filter(json!({"Ward": {"$regex": "^icu", "$options": "i"}}))).unwrap());
        assert!(matches(&d, &filter(json!({"$or": [{"Status": "Closed"}, {"Status": "Open"}]}))).unwrap());
        assert!(!matches(&d, &filter(json!({"$nor": [{"Status": "Open"}]}))).unwrap());
        assert!(matches(&d, &filter(json!({"Status": {"$in": ["Open", "New"]}}))).unwrap());
        assert!(matches(&d, &filter(json!({"Status": {"$not": {"$eq": "Closed"}}}))).unwrap());
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let d = filter(json!({"a": 1}));
        assert!(matches(&d, &filter(json!({"a": {"$near": 1}}))).is_err());
        assert!(matches(&d, &filter(json!({"$where": "true"}))).is_err());
    }

    #[test]
    fn grouped_count_sorted_and_projected() {
        let out = run(
            json!([{"Ward": "A"}, {"Ward": "B"}, {"Ward": "B"}, {"Ward": "C"}, {"Ward": "B"}]),
            json!([
                {"$group": {"_id": "$Ward", "count": {"$sum": 1}}},
                {"$sort": {"count": -1}},
                {"$limit": 2},
                {"$project": {"_id": 0, "Ward": "$_id", "count": 1}}
            ]),
        )
        .unwrap();
        assert_eq!(out, json!([{"Ward": "B", "count": 3}, {"Ward": "A", "count": 1}]));
    }

    #[test]
    fn group_keys_compare_by_value_not_text() {
        let out = run(
            json!([
                {"Bed": 9}, {"Bed": 9.0}, {"Bed": 10},
                {"Key": {"a": 1, "b": 2}}, {"Key": {"b": 2, "a": 1}}
            ]),
            json!([{"$group": {"_id": {"bed": "$Bed", "key": "$Key"}, "n": {"$sum": 1}}}]),
        )
        .unwrap();
        let counts: Vec<i64> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|g| g["n"].as_i64().unwrap())
            .collect();
        assert_eq!(counts, vec![2, 1, 2]);
    }

    #[test]
    fn converted_reduction_skips_unparseable_values() {
        let out = run(
            json!([{"v": "10"}, {"v": 20}, {"v": "n/a"}, {}]),
            json!([
                {"$group": {"_id": null, "average": {"$avg": {"$convert": {"input": "$v", "to": "double", "onError": null, "onNull": null}}}}},
                {"$project": {"_id": 0, "average": 1}}
            ]),
        )
        .unwrap();
        assert_eq!(out, json!([{"average": 15.0}]));
    }

    #[test]
    fn to_double_without_fallback_fails() {
        let err = run(
            json!([{"v": "abc"}]),
            json!([{"$group": {"_id": null, "m": {"$max": {"$toDouble": "$v"}}}}]),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::Store(_)));
    }

    #[test]
    fn add_to_set_and_size_count_distinct_values() {
        let out = run(
            json!([
                {"Ward": "A", "DeviceId": "d1"},
                {"Ward": "A", "DeviceId": "d1"},
                {"Ward": "A", "DeviceId": "d2"},
                {"Ward": "B", "DeviceId": "d3"}
            ]),
            json!([
                {"$group": {"_id": "$Ward", "uniqueValues": {"$addToSet": "$DeviceId"}}},
                {"$project": {"_id": 0, "Ward": "$_id", "distinctCount": {"$size": "$uniqueValues"}}},
                {"$sort": {"distinctCount": -1}}
            ]),
        )
        .unwrap();
        assert_eq!(out, json!([{"Ward": "A", "distinctCount": 2}, {"Ward": "B", "distinctCount": 1}]));
    }

    #[test]
    fn facet_runs_branches_over_the_same_input() {
        let out = run(
            json!([
                {"Status": "Critical", "Timestamp": "2024-09-01T08:00:00Z"},
                {"Status": "Normal", "Timestamp": "2024-09-01T09:00:00Z"},
                {"Status": "Critical", "Timestamp": "2024-09-02T10:00:00Z"}
            ]),
            json!([
                {"$addFields": {"parsed": {"$toDate": "$Timestamp"}}},
                {"$facet": {
                    "critical": [{"$match": {"Status": "Critical"}}, {"$count": "count"}],
                    "daily": [
                        {"$group": {"_id": {"$dateToString": {"format": "%Y-%m-%d", "date": "$parsed"}}, "count": {"$sum": 1}}},
                        {"$sort": {"_id": 1}},
                        {"$project": {"_id": 0, "date": "$_id", "count": 1}}
                    ],
                    "none": [{"$match": {"Status": "Missing"}}, {"$count": "count"}]
                }}
            ]),
        )
        .unwrap();
        assert_eq!(
            out,
            json!([{
                "critical": [{"count": 2}],
                "daily": [{"date": "2024-09-01", "count": 2}, {"date": "2024-09-02", "count": 1}],
                "none": []
            }])
        );
    }

    #[test]
    fn nested_facet_is_rejected() {
        let err = run(
            json!([{}]),
            json!([{"$facet": {"a": [{"$facet": {"b": []}}]}}]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("$facet"));
    }

    #[test]
    fn projection_modes() {
        let d = filter(json!({"_id": 7, "DeviceId": "d1", "LogData": {"Ward": "ICU", "Model": "X"}}));
        assert_eq!(
            Value::Object(project(&d, &filter(json!({"DeviceId": 1, "_id": 0}))).unwrap()),
            json!({"DeviceId": "d1"})
        );
        assert_eq!(
            Value::Object(project(&d, &filter(json!({"LogData.Ward": 1}))).unwrap()),
            json!({"_id": 7, "LogData": {"Ward": "ICU"}})
        );
        assert_eq!(
            Value::Object(project(&d, &filter(json!({"LogData": 0}))).unwrap()),
            json!({"_id": 7, "DeviceId": "d1"})
        );
        assert!(project(&d, &filter(json!({"DeviceId": 1, "LogData": 0}))).is_err());
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = run(json!([{}]), json!([{"$lookup": {}}])).unwrap_err();
        assert!(err.to_string().contains("$lookup"));
    }
}
