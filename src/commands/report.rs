use anyhow::Result;

use crate::commands::{CommandReport, Runtime};
use crate::snap::pipeline::JobOutcome;

pub fn run(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("daily-report");
    let outcome = rt.pipeline()?.daily_report()?;
    report.job(&outcome, |report, daily| {
        report.detail(format!("date={}", daily.date));
        report.detail(daily.summary.clone());
        for highlight in &daily.highlights {
            report.detail(format!("- {highlight}"));
        }
    });
    if let JobOutcome::Done(daily) = &outcome {
        report.detail(format!(
            "written={}",
            rt.paths.display(&rt.paths.daily_report_path(&daily.date))
        ));
        report.attach(daily)?;
    }
    Ok(report)
}
