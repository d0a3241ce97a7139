use anyhow::Result;
use std::collections::BTreeMap;

use crate::commands::{CommandReport, Runtime};
use crate::snap::intake::{Intake, scan_new_snapshots};
use crate::snap::pipeline::ProcessOutcome;

fn outcome_key(outcome: Option<&ProcessOutcome>) -> &'static str {
    match outcome {
        None => "failed",
        Some(ProcessOutcome::Missing) => "missing",
        Some(ProcessOutcome::Unstable) => "unstable",
        Some(ProcessOutcome::Rejected(_)) => "rejected",
        Some(ProcessOutcome::DarkFrame) => "dark",
        Some(ProcessOutcome::MotionSkipped { .. }) => "motion_skipped",
        Some(ProcessOutcome::Annotated { .. }) => "annotated",
    }
}

/// Enqueue the backlog after the progress marker and drain it once.
pub fn run(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("scan");
    let pipeline = rt.pipeline()?;
    let intake = Intake::new();
    let queued = scan_new_snapshots(
        &intake,
        pipeline.index(),
        &rt.paths.last_processed(),
        rt.cfg.tz(),
    )?;
    report.detail(format!("queued={queued}"));

    let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (path, outcome) in intake.drain(&*pipeline) {
        let key = outcome_key(outcome.as_ref());
        if key == "failed" {
            report.issue(format!("processing failed for {}", rt.paths.display(&path)));
        }
        *tally.entry(key).or_default() += 1;
    }
    for (key, count) in &tally {
        report.detail(format!("{key}={count}"));
    }
    report.attach(&tally)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_keys_are_stable() {
        assert_eq!(outcome_key(None), "failed");
        assert_eq!(outcome_key(Some(&ProcessOutcome::Annotated { described: false })), "annotated");
        assert_eq!(
            outcome_key(Some(&ProcessOutcome::MotionSkipped { change: 0.0 })),
            "motion_skipped"
        );
    }
}
