use anyhow::Result;

use crate::commands::{CommandReport, Runtime};
use crate::snap::usage::summarize_usage;

pub fn run(rt: &Runtime, days: u64) -> Result<CommandReport> {
    let mut report = CommandReport::new("usage");
    let summary = summarize_usage(&rt.store, days)?;
    report.detail(format!(
        "last {}d: tokens in={} out={} total={} cost=${:.6}",
        summary.window_days,
        summary.totals.input_tokens,
        summary.totals.output_tokens,
        summary.totals.total_tokens,
        summary.totals.cost_usd
    ));
    for (provider, totals) in &summary.by_provider {
        report.detail(format!(
            "{provider}: total={} cost=${:.6}",
            totals.total_tokens, totals.cost_usd
        ));
    }
    for day in &summary.by_day {
        report.detail(format!("{}: total={}", day.date, day.totals.total_tokens));
    }
    report.attach(&summary)?;
    Ok(report)
}
