//! Age-based eviction of snapshots, their mirrored artifacts and old records.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::snap::config::LookoutConfig;
use crate::snap::paths::{ArtifactKind, LookoutPaths};
use crate::snap::record_store::{RecordList, RecordStore};
use crate::snap::snapshots::{SnapshotIndex, modified_time, parse_capture_time};
use crate::snap::storage::move_file;
use crate::snap::util::to_utc_iso;

const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub archive: bool,
    pub cutoff: String,
    pub removed: usize,
    pub archived: usize,
    pub kept: usize,
    pub failed: usize,
    pub artifacts_removed: usize,
    pub pruned: BTreeMap<String, usize>,
}

impl RetentionReport {
    pub fn pruned_total(&self) -> usize {
        self.pruned.values().sum()
    }
}

pub fn cleanup(
    cfg: &LookoutConfig,
    store: &RecordStore,
    dry_run: bool,
    archive: bool,
) -> Result<RetentionReport> {
    cleanup_at(cfg, store, Utc::now(), dry_run, archive)
}

/// Evict everything older than `retention.days` before `now`, keeping the
/// newest `retention.min_snapshots` snapshots regardless of age.
pub fn cleanup_at(
    cfg: &LookoutConfig,
    store: &RecordStore,
    now: DateTime<Utc>,
    dry_run: bool,
    archive: bool,
) -> Result<RetentionReport> {
    let paths = LookoutPaths::new(&cfg.data_dir);
    let tz = cfg.tz();
    let cutoff = now - Duration::days(cfg.retention.days.min(MAX_RETENTION_DAYS) as i64);
    let mut report = RetentionReport {
        dry_run,
        archive,
        cutoff: to_utc_iso(cutoff),
        ..RetentionReport::default()
    };

    let snapshots = SnapshotIndex::new(&paths.snapshots_dir).list()?;
    let floor = snapshots.len().saturating_sub(cfg.retention.min_snapshots);
    report.kept = snapshots.len() - floor;

    for snapshot in &snapshots[..floor] {
        let captured = parse_capture_time(snapshot, tz)
            .or_else(|| modified_time(snapshot).map(DateTime::<Utc>::from));
        if captured.is_none_or(|at| at >= cutoff) {
            report.kept += 1;
            continue;
        }
        if dry_run {
            info!(path = %paths.display(snapshot), "would remove snapshot");
            report.removed += 1;
            report.artifacts_removed += mirrored_artifacts(&paths, snapshot).len();
            continue;
        }
        match evict(&paths, snapshot, archive) {
            Ok(artifacts) => {
                if archive {
                    report.archived += 1;
                } else {
                    report.removed += 1;
                }
                report.artifacts_removed += artifacts;
            }
            Err(err) => {
                warn!(
                    path = %paths.display(snapshot),
                    error = %format!("{err:#}"),
                    "retention failed for snapshot"
                );
                report.failed += 1;
            }
        }
    }

    for list in RecordList::ALL {
        let pruned = store
            .prune(list, cutoff, dry_run)
            .with_context(|| format!("failed to prune {list}"))?;
        report.pruned.insert(list.as_str().to_string(), pruned);
    }

    info!(
        removed = report.removed,
        archived = report.archived,
        kept = report.kept,
        failed = report.failed,
        artifacts = report.artifacts_removed,
        pruned = report.pruned_total(),
        dry_run,
        "retention cleanup finished"
    );
    Ok(report)
}

fn mirrored_artifacts(paths: &LookoutPaths, snapshot: &Path) -> Vec<(ArtifactKind, PathBuf)> {
    ArtifactKind::ALL
        .into_iter()
        .filter_map(|kind| paths.artifact_path(kind, snapshot).map(|p| (kind, p)))
        .filter(|(_, p)| p.is_file())
        .collect()
}

fn evict(paths: &LookoutPaths, snapshot: &Path, archive: bool) -> Result<usize> {
    let backup_root = paths.retention_backup_root();
    let rel = paths.snapshot_rel(snapshot);
    if archive {
        let target = match &rel {
            Some(rel) => backup_root.join(rel),
            None => backup_root.join(snapshot.file_name().unwrap_or_default()),
        };
        move_file(snapshot, &target)?;
    } else {
        fs::remove_file(snapshot)
            .with_context(|| format!("failed to remove {}", snapshot.display()))?;
    }

    let mut artifacts = 0;
    for (kind, artifact) in mirrored_artifacts(paths, snapshot) {
        let result = match (&rel, archive) {
            (Some(rel), true) => {
                let target = backup_root.join(kind.dir_name()).join(rel).with_extension("json");
                move_file(&artifact, &target)
            }
            _ => fs::remove_file(&artifact)
                .with_context(|| format!("failed to remove {}", artifact.display())),
        };
        match result {
            Ok(()) => artifacts += 1,
            Err(err) => warn!(
                path = %artifact.display(),
                error = %format!("{err:#}"),
                "artifact eviction failed"
            ),
        }
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snap::snapshots::build_snapshot_path;
    use chrono::TimeZone;
    use chrono_tz::Tz;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _tmp: TempDir,
        cfg: LookoutConfig,
        store: RecordStore,
        paths: LookoutPaths,
        now: DateTime<Utc>,
    }

    fn fixture(min_snapshots: usize) -> Fixture {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = LookoutConfig::default();
        cfg.data_dir = tmp.path().to_path_buf();
        cfg.camera.timezone = "UTC".to_string();
        cfg.retention.days = 1;
        cfg.retention.min_snapshots = min_snapshots;
        let store = RecordStore::open(tmp.path()).expect("store");
        let paths = LookoutPaths::new(tmp.path());
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).single().expect("now");
        Fixture {
            _tmp: tmp,
            cfg,
            store,
            paths,
            now,
        }
    }

    fn seed(fx: &Fixture, hours_ago: i64) -> PathBuf {
        let at = fx.now - Duration::hours(hours_ago);
        let snapshot = build_snapshot_path(&fx.paths.snapshots_dir, at.with_timezone(&Tz::UTC));
        fs::create_dir_all(snapshot.parent().expect("parent")).expect("mkdir");
        fs::write(&snapshot, b"jpeg").expect("snapshot");
        let artifact = fx
            .paths
            .artifact_path(ArtifactKind::Descriptions, &snapshot)
            .expect("artifact path");
        fs::create_dir_all(artifact.parent().expect("parent")).expect("mkdir");
        fs::write(&artifact, b"{}").expect("artifact");
        fx.store
            .append(
                RecordList::Descriptions,
                &json!({
                    "timestamp": to_utc_iso(at),
                    "snapshot": fx.paths.display(&snapshot),
                    "text": "x"
                }),
            )
            .expect("append");
        snapshot
    }

    #[test]
    fn removes_expired_snapshots_artifacts_and_records() {
        let fx = fixture(0);
        let old = seed(&fx, 48);
        let older_than_day = seed(&fx, 25);
        let recent = seed(&fx, 1);

        let report = cleanup_at(&fx.cfg, &fx.store, fx.now, false, false).expect("cleanup");
        assert_eq!((report.removed, report.kept, report.failed), (2, 1, 0));
        assert_eq!(report.artifacts_removed, 2);
        assert_eq!(report.pruned["descriptions"], 2);
        assert!(!old.exists() && !older_than_day.exists());
        assert!(recent.exists());
        let artifact = |p: &Path| {
            fx.paths
                .artifact_path(ArtifactKind::Descriptions, p)
                .expect("artifact")
        };
        assert!(!artifact(&old).exists());
        assert!(artifact(&recent).exists());
        assert_eq!(fx.store.count(RecordList::Descriptions).expect("count"), 1);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let fx = fixture(0);
        let old = seed(&fx, 48);
        let report = cleanup_at(&fx.cfg, &fx.store, fx.now, true, false).expect("cleanup");
        assert!(report.dry_run);
        assert_eq!(report.removed, 1);
        assert_eq!(report.pruned["descriptions"], 1);
        assert!(old.exists());
        assert_eq!(fx.store.count(RecordList::Descriptions).expect("count"), 1);
    }

    #[test]
    fn archive_mode_moves_snapshot_and_artifacts_into_backups() {
        let fx = fixture(0);
        let old = seed(&fx, 48);
        let rel = fx.paths.snapshot_rel(&old).expect("rel");
        let report = cleanup_at(&fx.cfg, &fx.store, fx.now, false, true).expect("cleanup");
        assert_eq!((report.archived, report.removed), (1, 0));
        let backup = fx.paths.retention_backup_root();
        assert!(backup.join(&rel).is_file());
        assert!(backup.join("descriptions").join(&rel).with_extension("json").is_file());
        assert!(!old.exists());
    }

    #[test]
    fn newest_snapshots_survive_under_the_floor() {
        let fx = fixture(5);
        let old = seed(&fx, 48);
        seed(&fx, 30);
        let report = cleanup_at(&fx.cfg, &fx.store, fx.now, false, false).expect("cleanup");
        assert_eq!((report.removed, report.kept), (0, 2));
        assert!(old.exists());
        // records still age out
        assert_eq!(report.pruned["descriptions"], 2);
    }
}
