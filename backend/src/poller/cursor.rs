// Poll cursors
//
// The cursor is an opaque string with three time-like interpretations (ISO
// date, numeric timestamp, RFC 2822 date) plus a structured value signature
// for sources whose items carry no date at all. Comparison dispatches on
// the cursor's syntactic shape; when shapes differ the comparator admits by
// default so a source migrating between shapes never silently loses items.

use chrono::DateTime;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// "2025-02-27" or a full ISO timestamp: lexicographic compare is valid.
    IsoDate,
    /// "1700000000.000100" (Slack ts and friends): compare as floats.
    NumericTs,
    /// "Thu, 27 Feb 2025 10:30:00 +0000": parse to epoch before comparing.
    Rfc2822,
    /// A structured value signature ("status:away|", "task:12:true", ...).
    Signature,
}

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("iso regex"))
}

pub fn classify(cursor: &str) -> CursorKind {
    let trimmed = cursor.trim();
    if iso_re().is_match(trimmed) {
        return CursorKind::IsoDate;
    }
    if trimmed.parse::<f64>().is_ok() {
        return CursorKind::NumericTs;
    }
    if DateTime::parse_from_rfc2822(trimmed).is_ok() {
        return CursorKind::Rfc2822;
    }
    CursorKind::Signature
}

/// True when `candidate` is strictly newer than `cursor`. Shape mismatch
/// admits by default; signature shapes admit on any difference.
pub fn is_newer(candidate: &str, cursor: &str) -> bool {
    let candidate_kind = classify(candidate);
    let cursor_kind = classify(cursor);
    if candidate_kind != cursor_kind {
        return true;
    }

    match candidate_kind {
        CursorKind::IsoDate => candidate.trim() > cursor.trim(),
        CursorKind::NumericTs => {
            match (candidate.trim().parse::<f64>(), cursor.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a > b,
                _ => true,
            }
        }
        CursorKind::Rfc2822 => {
            match (
                DateTime::parse_from_rfc2822(candidate.trim()),
                DateTime::parse_from_rfc2822(cursor.trim()),
            ) {
                (Ok(a), Ok(b)) => a.timestamp() > b.timestamp(),
                _ => true,
            }
        }
        CursorKind::Signature => candidate != cursor,
    }
}

/// Pick the more recent of two cursors, used when advancing after a poll.
pub fn max_cursor<'a>(a: &'a str, b: &'a str) -> &'a str {
    if is_newer(b, a) {
        b
    } else {
        a
    }
}

const DATE_FIELDS: &[&str] = &[
    "date",
    "day",
    "timestamp",
    "ts",
    "created_at",
    "createdAt",
    "added_at",
    "updated_at",
    "updatedAt",
    "start_time",
    "startTime",
    "end_time",
    "time",
];

/// Extract an item's date/timestamp by probing well-known field names.
pub fn extract_item_date(item: &Value) -> Option<String> {
    let map = item.as_object()?;
    for field in DATE_FIELDS {
        match map.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Build a value signature for items with no date: a compact fingerprint of
/// the fields that signal change.
pub fn value_signature(item: &Value) -> Option<String> {
    let map = item.as_object()?;

    if let Some(presence) = map.get("presence").and_then(Value::as_str) {
        return Some(format!("presence:{presence}"));
    }

    if map.contains_key("status_text") || map.contains_key("status_emoji") {
        let text = map.get("status_text").and_then(Value::as_str).unwrap_or("");
        let emoji = map.get("status_emoji").and_then(Value::as_str).unwrap_or("");
        return Some(format!("status:{text}|{emoji}"));
    }

    if let (Some(id), Some(completed)) = (map.get("id"), map.get("completed")) {
        let id = scalar_string(id);
        let completed = scalar_string(completed);
        return Some(format!("task:{id}:{completed}"));
    }

    if let Some(state) = map.get("state") {
        return Some(format!("state:{}", scalar_string(state)));
    }

    if let Some(status) = map.get("status") {
        return Some(format!("status:{}", scalar_string(status)));
    }

    None
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The cursor value an item would write: its date if it has one, otherwise
/// its value signature.
pub fn item_cursor(item: &Value) -> Option<String> {
    extract_item_date(item).or_else(|| value_signature(item))
}

/// Is this item new relative to the stored cursor? No cursor admits
/// everything; an item with neither date nor signature is admitted (it can
/// never be proven seen).
pub fn is_new_item(item: &Value, cursor: Option<&str>) -> bool {
    let Some(cursor) = cursor else {
        return true;
    };
    match item_cursor(item) {
        Some(candidate) => is_newer(&candidate, cursor),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification() {
        assert_eq!(classify("2025-02-27"), CursorKind::IsoDate);
        assert_eq!(classify("2025-02-27T10:00:00Z"), CursorKind::IsoDate);
        assert_eq!(classify("1700000000.000100"), CursorKind::NumericTs);
        assert_eq!(
            classify("Thu, 27 Feb 2025 10:30:00 +0000"),
            CursorKind::Rfc2822
        );
        assert_eq!(classify("status:away|"), CursorKind::Signature);
        assert_eq!(classify("task:12:true"), CursorKind::Signature);
    }

    #[test]
    fn iso_dates_compare_lexicographically() {
        assert!(is_newer("2025-02-28", "2025-02-27"));
        assert!(!is_newer("2025-02-27", "2025-02-27"));
        assert!(!is_newer("2025-02-26", "2025-02-27"));
    }

    #[test]
    fn numeric_timestamps_compare_as_floats() {
        // Lexicographic comparison would get this wrong: "9.5" > "10.2".
        assert!(is_newer("10.2", "9.5"));
        assert!(is_newer("1700000001.000001", "1700000000.999999"));
        assert!(!is_newer("1700000000.000001", "1700000000.000001"));
    }

    #[test]
    fn rfc2822_parses_before_comparing() {
        // Lexicographic comparison is wrong for weekday-prefixed dates:
        // "Fri" < "Thu" as strings, but the Friday is later.
        assert!(is_newer(
            "Fri, 28 Feb 2025 08:00:00 +0000",
            "Thu, 27 Feb 2025 10:30:00 +0000"
        ));
        assert!(!is_newer(
            "Wed, 26 Feb 2025 08:00:00 +0000",
            "Thu, 27 Feb 2025 10:30:00 +0000"
        ));
    }

    #[test]
    fn shape_mismatch_admits() {
        // Transitioning a service from date-based to timestamp-based
        // polling must not silently drop items.
        assert!(is_newer("1700000000.5", "2025-02-27"));
        assert!(is_newer("2025-02-27", "1700000000.5"));
    }

    #[test]
    fn signatures_admit_on_difference() {
        assert!(is_newer("status:away|", "status:active|"));
        assert!(!is_newer("status:away|", "status:away|"));
    }

    #[test]
    fn date_extraction_probes_fields() {
        assert_eq!(
            extract_item_date(&json!({"day": "2025-02-27", "score": 70})),
            Some("2025-02-27".to_string())
        );
        assert_eq!(
            extract_item_date(&json!({"ts": "1700000000.000100"})),
            Some("1700000000.000100".to_string())
        );
        assert_eq!(extract_item_date(&json!({"score": 70})), None);
    }

    #[test]
    fn signatures_for_dateless_items() {
        assert_eq!(
            value_signature(&json!({"presence": "away"})),
            Some("presence:away".to_string())
        );
        assert_eq!(
            value_signature(&json!({"status_text": "lunch", "status_emoji": ":taco:"})),
            Some("status:lunch|:taco:".to_string())
        );
        assert_eq!(
            value_signature(&json!({"id": 12, "completed": true, "content": "x"})),
            Some("task:12:true".to_string())
        );
        assert_eq!(
            value_signature(&json!({"state": "open"})),
            Some("state:open".to_string())
        );
        assert_eq!(value_signature(&json!({"content": "x"})), None);
    }

    #[test]
    fn new_item_detection() {
        let item = json!({"day": "2025-02-27", "score": 65});
        assert!(is_new_item(&item, None));
        assert!(is_new_item(&item, Some("2025-02-26")));
        assert!(!is_new_item(&item, Some("2025-02-27")));

        let task = json!({"id": 9, "completed": false});
        assert!(is_new_item(&task, Some("task:9:true")));
        assert!(!is_new_item(&task, Some("task:9:false")));
    }

    #[test]
    fn max_cursor_picks_newer() {
        assert_eq!(max_cursor("2025-02-26", "2025-02-27"), "2025-02-27");
        assert_eq!(max_cursor("2025-02-27", "2025-02-26"), "2025-02-27");
    }
}
