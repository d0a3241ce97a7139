use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub vehicles: Vec<String>,
    #[serde(default)]
    pub objects: Vec<String>,
}

impl Tags {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty() && self.vehicles.is_empty() && self.objects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRecord {
    pub timestamp: String,
    pub snapshot: String,
    pub text: String,
    #[serde(default)]
    pub tags: Tags,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    #[serde(default)]
    pub latency_ms: f64,
}

/// Shared shape of `compare_10m`, `compare_hourly` and `compare_custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareRecord {
    pub timestamp: String,
    pub snapshot_a: String,
    pub snapshot_b: String,
    pub text: String,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    #[serde(default)]
    pub latency_ms: f64,
}

/// Top label counts per tag kind.
pub type TagCounts = BTreeMap<String, Vec<(String, u64)>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    pub timestamp: String,
    pub date: String,
    pub summary: String,
    pub text: String,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub tags: TagCounts,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub lookback_hours: u64,
    pub items: usize,
}

/// Answer to a question over recent descriptions. Not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskAnswer {
    pub timestamp: String,
    pub answer: String,
    pub window: AskWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}
