use anyhow::Result;

use crate::commands::{CommandReport, Runtime};
use crate::snap::retention::cleanup;

pub fn run(rt: &Runtime, dry_run: bool, archive: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("cleanup");
    let outcome = cleanup(&rt.cfg, &rt.store, dry_run, archive)?;
    if dry_run {
        report.detail("dry run: nothing was changed");
    }
    report.detail(format!("cutoff={}", outcome.cutoff));
    report.detail(format!(
        "removed={} archived={} kept={} failed={} artifacts={}",
        outcome.removed, outcome.archived, outcome.kept, outcome.failed, outcome.artifacts_removed
    ));
    for (list, pruned) in &outcome.pruned {
        report.detail(format!("pruned.{list}={pruned}"));
    }
    if outcome.failed > 0 {
        report.issue(format!("{} snapshot(s) could not be removed", outcome.failed));
    }
    report.attach(&outcome)?;
    Ok(report)
}
