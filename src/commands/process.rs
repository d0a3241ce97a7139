use anyhow::{Context, Result};
use std::path::Path;

use crate::commands::{CommandReport, Runtime};
use crate::snap::pipeline::ProcessOutcome;

pub fn run(rt: &Runtime, path: &Path) -> Result<CommandReport> {
    let mut report = CommandReport::new("process");
    let path = std::path::absolute(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let pipeline = rt.pipeline()?;
    let outcome = pipeline.process(&path)?;
    report.detail(format!("snapshot={}", rt.paths.display(&path)));
    describe_outcome(&mut report, &outcome);
    Ok(report)
}

pub fn describe_outcome(report: &mut CommandReport, outcome: &ProcessOutcome) {
    match outcome {
        ProcessOutcome::Missing => report.issue("snapshot not found"),
        ProcessOutcome::Unstable => report.issue("snapshot still being written; try again later"),
        ProcessOutcome::Rejected(reason) => report.issue(format!("snapshot rejected: {reason}")),
        ProcessOutcome::DarkFrame => report.issue("dark frame skipped"),
        ProcessOutcome::MotionSkipped { change } => {
            report.detail(format!("motion below threshold (change={change:.2}%)"));
        }
        ProcessOutcome::Annotated { described: true } => report.detail("description recorded"),
        ProcessOutcome::Annotated { described: false } => {
            report.issue("description failed; snapshot marked processed without a record");
        }
    }
}
