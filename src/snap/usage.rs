use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::snap::config::LookoutConfig;
use crate::snap::providers::TokenUsage;
use crate::snap::record_store::{RecordList, RecordStore};
use crate::snap::records::UsageRecord;
use crate::snap::util::{now_utc_iso, parse_iso};

const MAX_WINDOW_DAYS: u64 = 36_500;

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub fn calculate_cost(cfg: &LookoutConfig, provider: &str, input: u64, output: u64) -> f64 {
    let (rate_in, rate_out) = match provider {
        "groq" => (cfg.groq.cost_per_million_input, cfg.groq.cost_per_million_output),
        "gemini" => (cfg.gemini.cost_per_million_input, cfg.gemini.cost_per_million_output),
        _ => (0.0, 0.0),
    };
    (input as f64 / 1_000_000.0) * rate_in + (output as f64 / 1_000_000.0) * rate_out
}

/// Append one `usage` record for an external call.
pub fn record_usage(
    store: &RecordStore,
    cfg: &LookoutConfig,
    provider: &str,
    model: &str,
    endpoint: &str,
    usage: TokenUsage,
) -> Result<UsageRecord> {
    let total = if usage.total == 0 {
        usage.input + usage.output
    } else {
        usage.total
    };
    let record = UsageRecord {
        timestamp: now_utc_iso(),
        provider: provider.to_string(),
        model: model.to_string(),
        endpoint: endpoint.to_string(),
        input_tokens: usage.input,
        output_tokens: usage.output,
        total_tokens: total,
        cost_usd: round6(calculate_cost(cfg, provider, usage.input, usage.output)),
    };
    store.append(RecordList::Usage, &record)?;
    Ok(record)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &Value) {
        let n = |key: &str| record.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.input_tokens += n("input_tokens");
        self.output_tokens += n("output_tokens");
        self.total_tokens += n("total_tokens");
        self.cost_usd += record.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
    }

    fn rounded(mut self) -> Self {
        self.cost_usd = round6(self.cost_usd);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayUsage {
    pub date: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub window_days: u64,
    pub totals: UsageTotals,
    pub by_provider: BTreeMap<String, UsageTotals>,
    pub by_day: Vec<DayUsage>,
}

/// Totals over the last `days`, overall, per provider and per UTC day.
pub fn summarize_usage(store: &RecordStore, days: u64) -> Result<UsageSummary> {
    let cutoff = Utc::now() - Duration::days(days.min(MAX_WINDOW_DAYS) as i64);
    let records = store.fetch_since(RecordList::Usage, cutoff)?;

    let mut totals = UsageTotals::default();
    let mut by_provider: BTreeMap<String, UsageTotals> = BTreeMap::new();
    let mut by_day: BTreeMap<String, UsageTotals> = BTreeMap::new();
    for record in &records {
        let Some(at) = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_iso)
        else {
            continue;
        };
        let provider = record
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        totals.add(record);
        by_provider.entry(provider).or_default().add(record);
        by_day
            .entry(at.format("%Y-%m-%d").to_string())
            .or_default()
            .add(record);
    }

    Ok(UsageSummary {
        window_days: days,
        totals: totals.rounded(),
        by_provider: by_provider
            .into_iter()
            .map(|(k, v)| (k, v.rounded()))
            .collect(),
        by_day: by_day
            .into_iter()
            .map(|(date, t)| DayUsage {
                date,
                totals: t.rounded(),
            })
            .collect(),
    })
}
