use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::snap::util::relative_display;

/// Artifact roots mirrored per snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Descriptions,
    Compare10m,
    CompareHourly,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Descriptions,
        ArtifactKind::Compare10m,
        ArtifactKind::CompareHourly,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Descriptions => "descriptions",
            Self::Compare10m => "compare_10m",
            Self::CompareHourly => "compare_hourly",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookoutPaths {
    pub data_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub daily_reports_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl LookoutPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            snapshots_dir: data_dir.join("snapshots"),
            daily_reports_dir: data_dir.join("daily_reports"),
            logs_dir: data_dir.join("logs"),
            backups_dir: data_dir.join("backups"),
            run_dir: data_dir.join("run"),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.snapshots_dir.clone(),
            self.daily_reports_dir.clone(),
            self.logs_dir.clone(),
            self.backups_dir.clone(),
            self.run_dir.clone(),
        ];
        dirs.extend(ArtifactKind::ALL.iter().map(|k| self.artifact_root(*k)));
        for dir in dirs {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn artifact_root(&self, kind: ArtifactKind) -> PathBuf {
        self.data_dir.join(kind.dir_name())
    }

    pub fn processing_lock(&self) -> PathBuf {
        self.run_dir.join("processing.lock")
    }

    pub fn last_processed(&self) -> PathBuf {
        self.run_dir.join("last_processed.json")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.run_dir.join("metrics.json")
    }

    pub fn preview_file(&self) -> PathBuf {
        self.run_dir.join("preview.jpg")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join("lookout.log")
    }

    pub fn retention_backup_root(&self) -> PathBuf {
        self.backups_dir.join("retention")
    }

    /// Snapshot path relative to the snapshots root, `/`-separated.
    pub fn snapshot_rel(&self, snapshot: &Path) -> Option<PathBuf> {
        snapshot
            .strip_prefix(&self.snapshots_dir)
            .ok()
            .map(Path::to_path_buf)
    }

    /// `<root>/<rel>.json` for a snapshot under the snapshots root.
    pub fn artifact_path(&self, kind: ArtifactKind, snapshot: &Path) -> Option<PathBuf> {
        let rel = self.snapshot_rel(snapshot)?;
        Some(self.artifact_root(kind).join(rel).with_extension("json"))
    }

    pub fn daily_report_path(&self, date: &str) -> PathBuf {
        self.daily_reports_dir.join(format!("{date}.json"))
    }

    /// Path recorded in documents: relative to the data dir.
    pub fn display(&self, path: &Path) -> String {
        relative_display(path, &self.data_dir)
    }
}
