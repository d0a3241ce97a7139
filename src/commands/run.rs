use anyhow::Result;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::commands::{CommandReport, Runtime};
use crate::snap::capture::Capturer;
use crate::snap::config::CameraSource;
use crate::snap::intake::{Intake, scan_new_snapshots};
use crate::snap::metrics::{storage_report, write_heartbeat};
use crate::snap::retention::cleanup;
use crate::snap::scheduler::{Job, Schedule, Scheduler};

const STOP_FILE: &str = "lookout.stop";
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const COMPARE_RECENT_INTERVAL: Duration = Duration::from_secs(600);

/// Long-running daemon: one intake worker plus the scheduled jobs. Touch
/// `run/lookout.stop` to shut it down between jobs.
pub fn run(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("run");
    let cfg = &rt.cfg;
    let pipeline = rt.pipeline()?;
    let capturer = Arc::new(Capturer::new(cfg)?);
    let intake = Arc::new(Intake::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let stop_file = rt.paths.run_dir.join(STOP_FILE);
    if stop_file.exists() {
        fs::remove_file(&stop_file)?;
    }

    let worker = intake.spawn_worker(pipeline.clone(), Arc::clone(&shutdown));
    let mut scheduler = Scheduler::new(cfg.tz(), Arc::clone(&shutdown));

    {
        let (intake, pipeline) = (Arc::clone(&intake), Arc::clone(&pipeline));
        let marker = rt.paths.last_processed();
        let tz = cfg.tz();
        scheduler.add(Job::new(
            "scan",
            Schedule::Every(Duration::from_secs(cfg.pipeline.scan_interval_secs)),
            move || scan_new_snapshots(&intake, pipeline.index(), &marker, tz).map(|_| ()),
        ));
    }

    if capturer.source() != CameraSource::WindowsHost {
        let (intake, capturer) = (Arc::clone(&intake), Arc::clone(&capturer));
        scheduler.add(Job::new(
            "capture",
            Schedule::Every(Duration::from_secs(cfg.camera.capture_interval_min * 60)),
            move || {
                let path = capturer.capture_snapshot()?;
                intake.enqueue(&path);
                Ok(())
            },
        ));
    }

    {
        let pipeline = Arc::clone(&pipeline);
        scheduler.add(Job::new(
            "compare_10m",
            Schedule::Every(COMPARE_RECENT_INTERVAL),
            move || pipeline.compare_recent().map(|_| ()),
        ));
    }
    {
        let pipeline = Arc::clone(&pipeline);
        scheduler.add(Job::new(
            "compare_hourly",
            Schedule::Hourly { minute: 0 },
            move || pipeline.compare_hourly().map(|_| ()),
        ));
    }
    {
        let pipeline = Arc::clone(&pipeline);
        scheduler.add(Job::new(
            "daily_report",
            Schedule::Daily { hour: 0, minute: 5 },
            move || pipeline.daily_report().map(|_| ()),
        ));
    }
    {
        let (cfg, store) = (cfg.clone(), Arc::clone(&rt.store));
        scheduler.add(Job::new(
            "retention",
            Schedule::Daily { hour: 1, minute: 0 },
            move || cleanup(&cfg, &store, false, false).map(|_| ()),
        ));
    }
    {
        let (metrics, intake) = (Arc::clone(&rt.metrics), Arc::clone(&intake));
        let (data_dir, heartbeat) = (rt.paths.data_dir.clone(), rt.paths.metrics_file());
        let interval_min = cfg.camera.capture_interval_min;
        scheduler.add(Job::new(
            "metrics",
            Schedule::Every(Duration::from_secs(cfg.pipeline.metrics_interval_secs)),
            move || {
                let snapshot =
                    metrics.report(storage_report(&data_dir), intake.depth(), interval_min);
                write_heartbeat(&heartbeat, &snapshot)
            },
        ));
    }

    let jobs = scheduler.job_names();
    info!(jobs = ?jobs, source = cfg.camera.source.as_str(), "lookout daemon started");
    let handles = scheduler.spawn();

    while !shutdown.load(Ordering::SeqCst) {
        if stop_file.exists() {
            info!("stop requested");
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    for handle in handles {
        if handle.join().is_err() {
            warn!("scheduled job thread panicked");
            report.issue("a scheduled job thread panicked");
        }
    }
    if worker.join().is_err() {
        report.issue("snapshot worker panicked");
    }
    let _ = fs::remove_file(&stop_file);

    report.detail(format!("jobs={}", jobs.join(",")));
    report.detail(format!("snapshots_processed={}", rt.metrics.snapshots_processed()));
    Ok(report)
}
