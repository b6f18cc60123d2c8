//! Relative-time handling: rewriting time phrases in the question before it
//! reaches the oracle, and resolving the `timeRange` pseudo-filter the oracle
//! may emit into a concrete range on the schema's time field.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static YESTERDAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\byesterday\b").unwrap());
static LAST_WEEK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blast (one )?week\b").unwrap());
static LAST_SEVEN_DAYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blast 7 days\b").unwrap());

pub fn iso(dt: NaiveDateTime) -> String {
    let base = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    let micros = dt.nanosecond() / 1_000;
    if micros == 0 {
        base
    } else {
        format!("{base}.{micros:06}")
    }
}

fn day_start(d: NaiveDate) -> NaiveDateTime {
    d.and_time(NaiveTime::default())
}

fn day_end(d: NaiveDate) -> NaiveDateTime {
    // 23:59:59.999999 is always a valid time
    d.and_hms_micro_opt(23, 59, 59, 999_999)
        .unwrap_or_else(|| day_start(d))
}

fn between(start: NaiveDateTime, end: NaiveDateTime) -> String {
    format!("Timestamp between '{}' and '{}'", iso(start), iso(end))
}

/// Replaces `yesterday`, `last week` and `last 7 days` with explicit
/// timestamp bounds relative to `today`.
pub fn preprocess_time_phrases(question: &str, today: NaiveDate) -> String {
    let mut q = question.to_string();
    if YESTERDAY.is_match(&q) {
        let y = today - Duration::days(1);
        q = YESTERDAY
            .replace_all(&q, between(day_start(y), day_end(y)).as_str())
            .into_owned();
    }
    if LAST_WEEK.is_match(&q) {
        let start = today - Duration::days(today.weekday().num_days_from_monday() as i64 + 7);
        let end = start + Duration::days(6);
        q = LAST_WEEK
            .replace_all(&q, between(day_start(start), day_end(end)).as_str())
            .into_owned();
    }
    if LAST_SEVEN_DAYS.is_match(&q) {
        let start = today - Duration::days(7);
        q = LAST_SEVEN_DAYS
            .replace_all(&q, between(day_start(start), day_end(today)).as_str())
            .into_owned();
    }
    q
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeRange {
    Today,
    Yesterday,
    LastWeek,
    LastMonth,
    LastDays(u32),
    LastHours(u32),
}

impl RelativeRange {
    /// Accepts `today`, `yesterday`, `last_week`, `last_month`,
    /// `last_<N>_days` and `last_<N>_hours` (spaces or underscores).
    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match norm.as_str() {
            "today" => return Some(RelativeRange::Today),
            "yesterday" => return Some(RelativeRange::Yesterday),
            "last_week" | "last_one_week" => return Some(RelativeRange::LastWeek),
            "last_month" => return Some(RelativeRange::LastMonth),
            _ => {}
        }
        let rest = norm.strip_prefix("last_")?;
        let (n, unit) = rest.split_once('_')?;
        let n: u32 = n.parse().ok().filter(|n| *n > 0)?;
        match unit {
            "day" | "days" => Some(RelativeRange::LastDays(n)),
            "hour" | "hours" => Some(RelativeRange::LastHours(n)),
            "week" | "weeks" => n.checked_mul(7).map(RelativeRange::LastDays),
            _ => None,
        }
    }

    /// `None` when the range reaches outside the representable calendar.
    pub fn bounds(self, now: DateTime<Utc>) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let now = now.naive_utc();
        let today = now.date();
        let back = |days: u64| today.checked_sub_days(Days::new(days));
        Some(match self {
            RelativeRange::Today => (day_start(today), now),
            RelativeRange::Yesterday => {
                let y = back(1)?;
                (day_start(y), day_end(y))
            }
            RelativeRange::LastWeek => {
                let start = back(today.weekday().num_days_from_monday() as u64 + 7)?;
                (day_start(start), day_end(start.checked_add_days(Days::new(6))?))
            }
            RelativeRange::LastMonth => {
                let first_this = today.with_day(1).unwrap_or(today);
                let last_prev = first_this.checked_sub_days(Days::new(1))?;
                let first_prev = last_prev.with_day(1).unwrap_or(last_prev);
                (day_start(first_prev), day_end(last_prev))
            }
            RelativeRange::LastDays(n) => (day_start(back(n as u64)?), day_end(today)),
            RelativeRange::LastHours(n) => {
                let start = now.checked_sub_signed(Duration::try_hours(n as i64)?)?;
                (start, now)
            }
        })
    }

    pub fn predicate(self, now: DateTime<Utc>) -> Option<Value> {
        let (start, end) = self.bounds(now)?;
        Some(json!({ "$gte": iso(start), "$lte": iso(end) }))
    }
}

/// Reads the relative tag out of a `timeRange` value: either a bare string
/// or `{"relative": "..."}`.
pub fn relative_tag(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s),
        Value::Object(m) => m.get("relative").and_then(Value::as_str),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn yesterday_is_rewritten_to_a_full_day() {
        // 2024-09-11 is a Wednesday
        let q = preprocess_time_phrases("alerts in OrgX Yesterday", date(2024, 9, 11));
        assert_eq!(
            q,
            "alerts in OrgX Timestamp between '2024-09-10T00:00:00' and '2024-09-10T23:59:59.999999'"
        );
    }

    #[test]
    fn last_week_is_previous_monday_to_sunday() {
        let q = preprocess_time_phrases("count for last one week", date(2024, 9, 11));
        assert_eq!(
            q,
            "count for Timestamp between '2024-09-02T00:00:00' and '2024-09-08T23:59:59.999999'"
        );
    }

    #[test]
    fn last_seven_days_includes_today() {
        let q = preprocess_time_phrases("last 7 days", date(2024, 9, 11));
        assert_eq!(
            q,
            "Timestamp between '2024-09-04T00:00:00' and '2024-09-11T23:59:59.999999'"
        );
    }

    #[test]
    fn questions_without_phrases_are_unchanged() {
        let q = "Which ward has the most alerts in OrgX?";
        assert_eq!(preprocess_time_phrases(q, date(2024, 9, 11)), q);
    }

    #[test]
    fn parses_relative_tags() {
        assert_eq!(RelativeRange::parse("last_30_days"), Some(RelativeRange::LastDays(30)));
        assert_eq!(RelativeRange::parse("last 6 hours"), Some(RelativeRange::LastHours(6)));
        assert_eq!(RelativeRange::parse("last_2_weeks"), Some(RelativeRange::LastDays(14)));
        assert_eq!(RelativeRange::parse("Last_Month"), Some(RelativeRange::LastMonth));
        assert_eq!(RelativeRange::parse("last_0_days"), None);
        assert_eq!(RelativeRange::parse("recently"), None);
    }

    #[test]
    fn last_month_spans_previous_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let (start, end) = RelativeRange::LastMonth.bounds(now).unwrap();
        assert_eq!(iso(start), "2024-02-01T00:00:00");
        assert_eq!(iso(end), "2024-02-29T23:59:59.999999");
    }

    #[test]
    fn last_days_predicate() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        assert_eq!(
            RelativeRange::LastDays(30).predicate(now),
            Some(json!({"$gte": "2024-02-14T00:00:00", "$lte": "2024-03-15T23:59:59.999999"}))
        );
    }

    #[test]
    fn week_counts_that_overflow_do_not_parse() {
        assert_eq!(RelativeRange::parse("last_999999999_weeks"), None);
        assert_eq!(
            RelativeRange::parse("last_613566756_weeks"),
            Some(RelativeRange::LastDays(4_294_967_292))
        );
    }

    #[test]
    fn ranges_past_the_calendar_have_no_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        let days = RelativeRange::parse("last_100000000_days").unwrap();
        assert_eq!(days.bounds(now), None);
        assert_eq!(days.predicate(now), None);
        assert_eq!(RelativeRange::LastHours(u32::MAX).bounds(now), None);
        assert!(RelativeRange::LastHours(6).bounds(now).is_some());
    }
}
