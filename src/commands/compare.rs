use anyhow::{Context, Result};
use std::path::Path;

use crate::commands::{CommandReport, Runtime};
use crate::snap::pipeline::JobOutcome;
use crate::snap::records::CompareRecord;

fn fold(report: &mut CommandReport, outcome: &JobOutcome<CompareRecord>) -> Result<()> {
    report.job(outcome, |report, record| {
        report.detail(format!("a={}", record.snapshot_a));
        report.detail(format!("b={}", record.snapshot_b));
        report.detail(record.text.clone());
    });
    if let JobOutcome::Done(record) = outcome {
        report.attach(record)?;
    }
    Ok(())
}

pub fn run_recent(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("compare-recent");
    let outcome = rt.pipeline()?.compare_recent()?;
    fold(&mut report, &outcome)?;
    Ok(report)
}

pub fn run_hourly(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("compare-hourly");
    let outcome = rt.pipeline()?.compare_hourly()?;
    fold(&mut report, &outcome)?;
    Ok(report)
}

pub fn run_custom(rt: &Runtime, a: &Path, b: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("compare");
    let a = std::path::absolute(a).with_context(|| format!("failed to resolve {}", a.display()))?;
    let b = std::path::absolute(b).with_context(|| format!("failed to resolve {}", b.display()))?;
    let outcome = rt.pipeline()?.compare_custom(&a, &b)?;
    fold(&mut report, &outcome)?;
    Ok(report)
}
