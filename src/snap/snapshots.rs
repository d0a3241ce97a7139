//! Snapshot discovery, capture-time parsing and nearest-time lookup.

use anyhow::Result;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use walkdir::WalkDir;

pub const SNAPSHOT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const CACHE_TTL: Duration = Duration::from_secs(2);

/// True for a finished snapshot file name (`.tmp` captures are ignored).
pub fn is_snapshot_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.to_ascii_lowercase().ends_with(".tmp") {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SNAPSHOT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Capture instant encoded as `<YYYY>/<MM>/<DD>/<HHMMSS>.<ext>` in `tz`.
pub fn parse_capture_time(path: &Path, tz: Tz) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    if parts.len() < 4 {
        return None;
    }
    let n = parts.len();
    let year: i32 = parts[n - 4].parse().ok()?;
    let month: u32 = parts[n - 3].parse().ok()?;
    let day: u32 = parts[n - 2].parse().ok()?;

    let stem = path.file_stem()?.to_str()?;
    if stem.len() < 6 || !stem.is_char_boundary(6) {
        return None;
    }
    let hour: u32 = stem[0..2].parse().ok()?;
    let minute: u32 = stem[2..4].parse().ok()?;
    let second: u32 = stem[4..6].parse().ok()?;

    tz.with_ymd_and_hms(year, month, day, hour, minute, second)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

pub fn build_snapshot_path(snapshots_dir: &Path, local: DateTime<Tz>) -> PathBuf {
    snapshots_dir
        .join(format!("{:04}", local.year()))
        .join(format!("{:02}", local.month()))
        .join(format!("{:02}", local.day()))
        .join(format!(
            "{:02}{:02}{:02}.jpg",
            local.hour(),
            local.minute(),
            local.second()
        ))
}

/// Human label used in prompts: local capture time, or the file name.
pub fn snapshot_label(path: &Path, tz: Tz) -> String {
    match parse_capture_time(path, tz) {
        Some(at) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Snapshot whose capture time is closest to `target`, within `max_delta`.
pub fn find_nearest(
    snapshots: &[PathBuf],
    target: DateTime<Utc>,
    tz: Tz,
    max_delta: chrono::Duration,
    exclude: Option<&Path>,
) -> Option<PathBuf> {
    let mut best: Option<(&PathBuf, chrono::Duration)> = None;
    for path in snapshots {
        if exclude.is_some_and(|ex| ex == path.as_path()) {
            continue;
        }
        let Some(at) = parse_capture_time(path, tz) else {
            continue;
        };
        let delta = (at - target).abs();
        if best.is_none_or(|(_, d)| delta < d) {
            best = Some((path, delta));
        }
    }
    match best {
        Some((path, delta)) if delta <= max_delta => Some(path.clone()),
        _ => None,
    }
}

/// Lists snapshot files under one root, oldest mtime first, with a short
/// cache so bursts of callers do not rescan the tree.
#[derive(Debug)]
pub struct SnapshotIndex {
    root: PathBuf,
    cache: Mutex<Option<(Instant, Vec<PathBuf>)>>,
}

impl SnapshotIndex {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some((at, files)) = cache.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return Ok(files.clone());
                }
            }
        }

        let files = self.scan();
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), files.clone()));
        }
        Ok(files)
    }

    fn scan(&self) -> Vec<PathBuf> {
        if !self.root.exists() {
            return Vec::new();
        }
        let mut files: Vec<(SystemTime, PathBuf)> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| is_snapshot_file(path))
            .map(|path| {
                let mtime = modified_time(&path).unwrap_or(SystemTime::UNIX_EPOCH);
                (mtime, path)
            })
            .collect();
        files.sort();
        files.into_iter().map(|(_, path)| path).collect()
    }
}
