use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::snap::records::{TagCounts, Tags};

pub const TAG_KINDS: [&str; 3] = ["people", "vehicles", "objects"];
const TOP_TAGS: usize = 5;

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json object regex"))
}

/// First `{...}` span in model output, parsed as JSON.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let found = json_object_re().find(text)?;
    serde_json::from_str(found.as_str()).ok()
}

fn clean_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single @ Value::String(_)) => vec![single],
        _ => Vec::new(),
    };
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let Some(text) = item.as_str() else { continue };
        let cleaned = text.trim().to_lowercase();
        if !cleaned.is_empty() && !out.contains(&cleaned) {
            out.push(cleaned);
        }
    }
    out
}

/// Lowercased, deduplicated tag lists from the tagger's JSON reply.
pub fn normalize_tags(data: Option<&Value>) -> Tags {
    let Some(object) = data.and_then(Value::as_object) else {
        return Tags::default();
    };
    Tags {
        people: clean_list(object.get("people")),
        vehicles: clean_list(object.get("vehicles")),
        objects: clean_list(object.get("objects")),
    }
}

/// Count labels per kind over description records; top five per kind.
pub fn aggregate_tags(records: &[Value]) -> TagCounts {
    let mut out = TagCounts::new();
    for kind in TAG_KINDS {
        let mut counts: HashMap<String, (u64, usize)> = HashMap::new();
        let mut seen = 0usize;
        for record in records {
            let Some(values) = record
                .get("tags")
                .and_then(|t| t.get(kind))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for value in values.iter().filter_map(Value::as_str) {
                let label = value.trim().to_lowercase();
                if label.is_empty() {
                    continue;
                }
                let entry = counts.entry(label).or_insert((0, seen));
                entry.0 += 1;
                seen += 1;
            }
        }
        let mut ranked: Vec<(String, u64, usize)> = counts
            .into_iter()
            .map(|(label, (count, first))| (label, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        out.insert(
            kind.to_string(),
            ranked
                .into_iter()
                .take(TOP_TAGS)
                .map(|(label, count, _)| (label, count))
                .collect(),
        );
    }
    out
}

/// `people: person(3), dog(1); vehicles: car(2)` or `none`.
pub fn format_tags_summary(counts: &TagCounts) -> String {
    let parts: Vec<String> = TAG_KINDS
        .iter()
        .filter_map(|kind| {
            let items = counts.get(*kind)?;
            if items.is_empty() {
                return None;
            }
            let joined = items
                .iter()
                .map(|(label, count)| format!("{label}({count})"))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!("{kind}: {joined}"))
        })
        .collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join("; ")
    }
}

/// First four labels per kind of one record's tags, e.g.
/// `people: person; objects: dog, bin`, or `none`.
pub fn format_tags_compact(tags: Option<&Value>) -> String {
    let Some(object) = tags.and_then(Value::as_object) else {
        return "none".to_string();
    };
    let parts: Vec<String> = TAG_KINDS
        .iter()
        .filter_map(|kind| {
            let values: Vec<&str> = match object.get(*kind) {
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
                Some(Value::String(single)) => vec![single.as_str()],
                _ => Vec::new(),
            };
            let cleaned: Vec<&str> = values
                .into_iter()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .take(4)
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(format!("{kind}: {}", cleaned.join(", ")))
            }
        })
        .collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join("; ")
    }
}

/// Summary and highlights from a daily-report reply; plain text falls back
/// to the whole reply as the summary.
pub fn parse_daily_response(text: &str) -> (String, Vec<String>) {
    if let Some(Value::Object(data)) = extract_json_object(text) {
        if let Some(summary) = data.get("summary").and_then(Value::as_str) {
            let highlights = data
                .get("highlights")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.trim().to_string(),
                            other => other.to_string(),
                        })
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            return (summary.trim().to_string(), highlights);
        }
    }
    (text.trim().to_string(), Vec::new())
}
