//! File-level persistence primitives shared by the pipeline and retention.
//!
//! - atomic JSON/text writes (temp file in the target directory, fsync, rename)
//! - advisory exclusive file locks
//! - the processing-progress marker and the schema-version marker

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const SCHEMA_VERSION: &str = "1.0.0";
const SCHEMA_VERSION_FILE: &str = "schema_version.txt";

/// Exclusive advisory lock on a lock file, held until drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.flush()?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to fsync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn atomic_write_text(path: &Path, data: &str) -> Result<()> {
    atomic_write_bytes(path, data.as_bytes())
}

pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    atomic_write_text(path, &format!("{data}\n"))
}

/// Read a JSON document; a missing or unparsable file reads as `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Move a file, falling back to copy + remove across devices.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(from, to) {
        Ok(_) => Ok(()),
        Err(rename_err) => {
            if matches!(
                rename_err.kind(),
                ErrorKind::CrossesDevices | ErrorKind::PermissionDenied
            ) {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                fs::remove_file(from)
                    .with_context(|| format!("failed to remove {}", from.display()))?;
                Ok(())
            } else {
                Err(rename_err).with_context(|| {
                    format!("failed to move {} to {}", from.display(), to.display())
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_time: Option<String>,
}

pub fn read_last_processed(path: &Path) -> ProcessingMarker {
    read_json(path).unwrap_or_default()
}

pub fn write_last_processed(path: &Path, marker: &ProcessingMarker) -> Result<()> {
    atomic_write_json(path, marker)
}

/// Write the schema version once; an existing marker is never touched.
pub fn write_schema_version(data_dir: &Path, version: &str) -> Result<bool> {
    let path = data_dir.join(SCHEMA_VERSION_FILE);
    if path.exists() {
        return Ok(false);
    }
    atomic_write_text(&path, version)?;
    Ok(true)
}

pub fn read_schema_version(data_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(data_dir.join(SCHEMA_VERSION_FILE)).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_json_round_trips_and_leaves_no_temp_files() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("nested/sample.json");
        atomic_write_json(&path, &json!({"value": 123})).expect("write");
        atomic_write_json(&path, &json!({"value": 456})).expect("overwrite");

        let data: Value = read_json(&path).expect("read back");
        assert_eq!(data["value"], 456);

        let names = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![std::ffi::OsString::from("sample.json")]);
    }

    #[test]
    fn read_json_treats_corrupt_documents_as_missing() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("broken.json");
        fs::write(&path, "{not json").expect("write");
        assert!(read_json::<Value>(&path).is_none());
        assert!(read_json::<Value>(&tmp.path().join("absent.json")).is_none());
    }

    #[test]
    fn schema_version_is_written_once() {
        let tmp = tempdir().expect("tempdir");
        assert!(write_schema_version(tmp.path(), "1.0.0").expect("first"));
        assert!(!write_schema_version(tmp.path(), "2.0.0").expect("second"));
        assert_eq!(read_schema_version(tmp.path()).as_deref(), Some("1.0.0"));
    }

    #[test]
    fn marker_round_trips_and_defaults_when_missing() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("run/last_processed.json");
        assert_eq!(read_last_processed(&path), ProcessingMarker::default());

        let marker = ProcessingMarker {
            timestamp: Some("2025-01-01T10:00:05Z".into()),
            path: Some("/data/snapshots/2025/01/01/100000.jpg".into()),
            snapshot_time: Some("2025-01-01T10:00:00Z".into()),
        };
        write_last_processed(&path, &marker).expect("write marker");
        assert_eq!(read_last_processed(&path), marker);
    }

    #[test]
    fn file_lock_serializes_critical_sections() {
        let tmp = tempdir().expect("tempdir");
        let lock_path = tmp.path().join("run/processing.lock");
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles = (0..2)
            .map(|id| {
                let lock_path = lock_path.clone();
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    let _guard = FileLock::exclusive(&lock_path).expect("lock");
                    log.lock().expect("log").push(format!("enter-{id}"));
                    thread::sleep(Duration::from_millis(50));
                    log.lock().expect("log").push(format!("exit-{id}"));
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let log = log.lock().expect("log");
        assert_eq!(log.len(), 4);
        assert!(log[0].starts_with("enter-"));
        assert_eq!(log[1], log[0].replace("enter", "exit"));
    }

    #[test]
    fn move_file_creates_target_directories() {
        let tmp = tempdir().expect("tempdir");
        let from = tmp.path().join("a.jpg");
        let to = tmp.path().join("backups/retention/2025/01/01/a.jpg");
        fs::write(&from, b"x").expect("write");
        move_file(&from, &to).expect("move");
        assert!(!from.exists());
        assert_eq!(fs::read(&to).expect("read"), b"x");
    }
}
