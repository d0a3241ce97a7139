use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;

use crate::commands::{CommandReport, Runtime};
use crate::snap::record_store::{FetchOptions, RecordList};

#[derive(Debug, Clone, Default)]
pub struct RecordsOptions {
    pub list: String,
    pub limit: Option<usize>,
    pub offset: usize,
    pub newest_first: bool,
    pub since_hours: Option<u64>,
}

fn page(mut records: Vec<Value>, opts: &RecordsOptions) -> Vec<Value> {
    if opts.newest_first {
        records.reverse();
    }
    records
        .into_iter()
        .skip(opts.offset)
        .take(opts.limit.unwrap_or(usize::MAX))
        .collect()
}

pub fn run(rt: &Runtime, opts: &RecordsOptions) -> Result<CommandReport> {
    let list: RecordList = opts.list.parse()?;
    let mut report = CommandReport::new("records");

    let records = match opts.since_hours {
        Some(hours) => {
            let cutoff = Utc::now() - Duration::hours(hours.min(24 * 36_500) as i64);
            page(rt.store.fetch_since(list, cutoff)?, opts)
        }
        None => rt.store.fetch(
            list,
            &FetchOptions {
                limit: opts.limit,
                offset: opts.offset,
                newest_first: opts.newest_first,
            },
        )?,
    };

    report.detail(format!("list={list} count={}", records.len()));
    for record in &records {
        report.detail(serde_json::to_string(record)?);
    }
    report.attach(&records)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paging_applies_order_then_offset_then_limit() {
        let records: Vec<Value> = (0..5).map(|n| json!({"n": n})).collect();
        let opts = RecordsOptions {
            newest_first: true,
            offset: 1,
            limit: Some(2),
            ..RecordsOptions::default()
        };
        assert_eq!(page(records, &opts), vec![json!({"n": 3}), json!({"n": 2})]);
    }
}
