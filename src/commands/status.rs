use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::commands::{CommandReport, Runtime};
use crate::snap::metrics::{HealthStatus, health_status, storage_report};
use crate::snap::record_store::RecordList;
use crate::snap::snapshots::SnapshotIndex;
use crate::snap::storage::{ProcessingMarker, read_json, read_last_processed, read_schema_version};

#[derive(Debug, Serialize)]
struct StatusView {
    data_dir: String,
    camera_source: &'static str,
    schema_version: Option<String>,
    snapshots: usize,
    latest_snapshot: Option<String>,
    last_processed: ProcessingMarker,
    records: BTreeMap<&'static str, usize>,
    disk_free_mb: f64,
    status: HealthStatus,
    heartbeat: Option<HeartbeatStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatStatus {
    timestamp: Option<String>,
    status: Option<String>,
}

pub fn run(rt: &Runtime) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let paths = &rt.paths;

    let snapshots = SnapshotIndex::new(&paths.snapshots_dir).list()?;
    let marker = read_last_processed(&paths.last_processed());
    let mut records = BTreeMap::new();
    for list in RecordList::ALL {
        records.insert(list.as_str(), rt.store.count(list)?);
    }
    let storage = storage_report(&paths.data_dir);
    let status = health_status(
        marker.timestamp.as_deref(),
        storage.disk_free_mb,
        0,
        rt.cfg.camera.capture_interval_min,
    );

    report.detail(format!("data_dir={}", paths.data_dir.display()));
    report.detail(format!("camera_source={}", rt.cfg.camera.source.as_str()));
    report.detail(format!("snapshots={}", snapshots.len()));
    if let Some(latest) = snapshots.last() {
        report.detail(format!("latest_snapshot={}", paths.display(latest)));
    }
    report.detail(format!(
        "last_processed={}",
        marker.timestamp.as_deref().unwrap_or("never")
    ));
    for (list, count) in &records {
        report.detail(format!("records.{list}={count}"));
    }
    report.detail(format!("disk_free_mb={:.2}", storage.disk_free_mb));
    report.detail(format!("health={}", status.as_str()));

    let heartbeat = read_json::<HeartbeatStatus>(&paths.metrics_file());
    if let Some(beat) = &heartbeat {
        report.detail(format!(
            "daemon_heartbeat={} ({})",
            beat.timestamp.as_deref().unwrap_or("?"),
            beat.status.as_deref().unwrap_or("?")
        ));
    }
    if status == HealthStatus::Unhealthy {
        report.issue(format!(
            "less than 100 MB free under {}",
            paths.data_dir.display()
        ));
    }

    report.attach(&StatusView {
        data_dir: paths.data_dir.display().to_string(),
        camera_source: rt.cfg.camera.source.as_str(),
        schema_version: read_schema_version(&paths.data_dir),
        snapshots: snapshots.len(),
        latest_snapshot: snapshots.last().map(|p| paths.display(p)),
        last_processed: marker,
        records,
        disk_free_mb: storage.disk_free_mb,
        status,
        heartbeat,
    })?;
    Ok(report)
}
