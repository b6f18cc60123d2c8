//! Turns a [`QueryResult`] into something a narrator can present.
//!
//! Large result lists are sampled, but the preamble always states the
//! total so the narration never under-reports.

use crate::intent::Document;
use crate::result::QueryResult;
use serde::Serialize;
use serde_json::Value;

/// Lists longer than this are sampled.
pub const SAMPLE_THRESHOLD: usize = 15;
pub const SAMPLE_SIZE: usize = 10;

/// Key fragments that mark a row as aggregation output.
const AGGREGATE_KEYS: &[&str] = &["count", "average", "sum", "total", "min", "max", "_id"];
const AGGREGATE_MAX_KEYS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayForm {
    NoResults,
    Table {
        preamble: Option<String>,
        /// Narrow `{key, metric}` table rather than raw records.
        aggregate: bool,
        columns: Vec<String>,
        rows: Vec<Document>,
        total: usize,
    },
    Scalar {
        label: String,
        value: Value,
    },
    Error {
        message: String,
    },
    Sections {
        sections: Vec<(String, DisplayForm)>,
    },
}

pub fn shape(result: &QueryResult) -> DisplayForm {
    match result {
        QueryResult::Records(rows) | QueryResult::Groups(rows) => shape_rows(rows),
        QueryResult::Count(n) => DisplayForm::Scalar {
            label: "Total count".into(),
            value: Value::from(*n),
        },
        QueryResult::Error(e) => DisplayForm::Error {
            message: e.message.clone(),
        },
        QueryResult::Facets(facets) => {
            if facets.is_empty() {
                return DisplayForm::NoResults;
            }
            DisplayForm::Sections {
                sections: facets
                    .iter()
                    .map(|(name, rows)| (name.clone(), shape_rows(rows)))
                    .collect(),
            }
        }
    }
}

pub fn shape_rows(rows: &[Document]) -> DisplayForm {
    let Some(first) = rows.first() else {
        return DisplayForm::NoResults;
    };
    let total = rows.len();
    let (preamble, kept) = if total > SAMPLE_THRESHOLD {
        let k = SAMPLE_SIZE.min(total);
        (
            Some(format!("Found {total} results. Showing top {k} as a sample:")),
            &rows[..k],
        )
    } else {
        (None, rows)
    };
    DisplayForm::Table {
        preamble,
        aggregate: looks_aggregated(first),
        // non-uniform documents are not reconciled beyond the first row
        columns: first.keys().cloned().collect(),
        rows: kept.to_vec(),
        total,
    }
}

fn looks_aggregated(row: &Document) -> bool {
    row.len() <= AGGREGATE_MAX_KEYS
        && row.keys().any(|k| {
            let k = k.to_ascii_lowercase();
            AGGREGATE_KEYS.iter().any(|a| k.contains(a))
        })
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None => String::new(),
        Some(Value::String(s)) => s.replace('|', "\\|"),
        Some(other) => other.to_string().replace('|', "\\|"),
    }
}

impl DisplayForm {
    /// Markdown rendering.
    pub fn render(&self) -> String {
        match self {
            DisplayForm::NoResults => "No results found.".to_string(),
            DisplayForm::Scalar { label, value } => format!("{label}: {}", cell(Some(value))),
            DisplayForm::Error { message } => format!("Error: {message}"),
            DisplayForm::Table {
                preamble,
                columns,
                rows,
                ..
            } => {
                let mut out = String::new();
                if let Some(p) = preamble {
                    out.push_str(p);
                    out.push_str("\n\n");
                }
                out.push_str(&format!("| {} |\n", columns.join(" | ")));
                out.push_str(&format!("|{}|\n", vec!["---"; columns.len()].join("|")));
                for row in rows {
                    let cells: Vec<String> = columns.iter().map(|c| cell(row.get(c))).collect();
                    out.push_str(&format!("| {} |\n", cells.join(" | ")));
                }
                out
            }
            DisplayForm::Sections { sections } => sections
                .iter()
                .map(|(name, form)| format!("### {name}\n\n{}", form.render()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DisplayForm::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StoreFailure;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn rows(v: Value) -> Vec<Document> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect()
    }

    fn records(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                json!({"DeviceId": format!("d{i}"), "Ward": "ICU", "Status": "Open", "Stage": i})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn empty_list_is_no_results() {
        assert_eq!(shape(&QueryResult::Records(vec![])), DisplayForm::NoResults);
        assert_eq!(DisplayForm::NoResults.render(), "No results found.");
    }

    #[test]
    fn twenty_records_are_sampled_to_ten() {
        let form = shape(&QueryResult::Records(records(20)));
        match &form {
            DisplayForm::Table {
                preamble,
                rows,
                total,
                aggregate,
                ..
            } => {
                assert_eq!(rows.len(), 10);
                assert_eq!(*total, 20);
                assert!(!aggregate);
                assert!(preamble.as_deref().unwrap().starts_with("Found 20 results."));
            }
            other => panic!("expected table, got {other:?}"),
        }
        let text = form.render();
        assert!(text.starts_with("Found 20 results. Showing top 10 as a sample:"));
        // header, rule and ten rows after the preamble
        assert_eq!(text.lines().filter(|l| l.starts_with('|')).count(), 12);
    }

    #[test]
    fn fifteen_records_are_not_sampled() {
        match shape(&QueryResult::Records(records(15))) {
            DisplayForm::Table { preamble, rows, .. } => {
                assert!(preamble.is_none());
                assert_eq!(rows.len(), 15);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn narrow_rows_with_metric_keys_are_aggregates() {
        let form = shape(&QueryResult::Groups(rows(json!([{"Ward": "B", "count": 9}]))));
        assert!(matches!(form, DisplayForm::Table { aggregate: true, .. }));
        assert_eq!(form.render(), "| Ward | count |\n|---|---|\n| B | 9 |\n");
    }

    #[test]
    fn columns_follow_first_row_and_missing_cells_are_blank() {
        let form = shape_rows(&rows(json!([{"a": 1, "b": "x"}, {"a": 2, "c": true}])));
        assert_eq!(form.render(), "| a | b |\n|---|---|\n| 1 | x |\n| 2 |  |\n");
    }

    #[test]
    fn count_and_error_render_as_text() {
        assert_eq!(shape(&QueryResult::Count(42)).render(), "Total count: 42");
        let err = shape(&QueryResult::Error(StoreFailure {
            message: "timed out".into(),
            shape: "find".into(),
            attempted: Value::Null,
        }));
        assert!(err.is_error());
        assert_eq!(err.render(), "Error: timed out");
    }

    #[test]
    fn facets_render_one_section_each() {
        let mut facets = BTreeMap::new();
        facets.insert("critical".to_string(), rows(json!([{"count": 3}])));
        facets.insert("topWard".to_string(), vec![]);
        let text = shape(&QueryResult::Facets(facets)).render();
        assert!(text.starts_with("### critical\n\n| count |"));
        assert!(text.ends_with("### topWard\n\nNo results found."));
    }
}
