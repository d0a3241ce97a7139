use anyhow::Result;

use crate::commands::{CommandReport, Runtime};
use crate::snap::capture::Capturer;

pub fn run(rt: &Runtime, preview: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("capture");
    let capturer = Capturer::new(&rt.cfg)?;
    report.detail(format!("source={}", capturer.source().as_str()));
    if preview {
        let path = capturer.capture_preview()?;
        report.detail(format!("preview={}", rt.paths.display(&path)));
    } else {
        let path = capturer.capture_snapshot()?;
        report.detail(format!("snapshot={}", rt.paths.display(&path)));
        report.detail("run `lookout scan` or the daemon to process it");
    }
    Ok(report)
}
