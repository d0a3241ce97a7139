use anyhow::Result;

use crate::commands::{CommandReport, Runtime};
use crate::snap::pipeline::JobOutcome;

pub fn run(
    rt: &Runtime,
    query: &str,
    lookback_hours: Option<u64>,
    max_items: Option<usize>,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("ask");
    let lookback_hours = lookback_hours.unwrap_or(rt.cfg.pipeline.ask_lookback_hours);
    let max_items = max_items.unwrap_or(rt.cfg.pipeline.ask_max_items);
    let outcome = rt.pipeline()?.ask(query, lookback_hours, max_items)?;
    report.job(&outcome, |report, answer| {
        if let Some(label) = &answer.window.label {
            report.detail(format!("window={label}"));
        }
        report.detail(format!(
            "lookback_hours={} items={}",
            answer.window.lookback_hours, answer.window.items
        ));
        report.detail(answer.answer.clone());
    });
    if let JobOutcome::Done(answer) = &outcome {
        report.attach(answer)?;
    }
    Ok(report)
}
