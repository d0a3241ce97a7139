//! Snapshot intake: a deduplicated FIFO drained by a single worker thread.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::snap::pipeline::{Pipeline, ProcessOutcome};
use crate::snap::snapshots::{SnapshotIndex, is_snapshot_file, modified_time, parse_capture_time};
use crate::snap::storage::read_last_processed;
use crate::snap::util::parse_iso;

const WORKER_POLL: Duration = Duration::from_millis(500);

pub trait SnapshotProcessor: Send + Sync {
    fn process(&self, path: &Path) -> Result<ProcessOutcome>;
}

impl SnapshotProcessor for Pipeline {
    fn process(&self, path: &Path) -> Result<ProcessOutcome> {
        Pipeline::process(self, path)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct Intake {
    queue: Mutex<VecDeque<PathBuf>>,
    ready: Condvar,
    inflight: Mutex<HashSet<PathBuf>>,
}

impl Intake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot unless it is not an image or already queued/in flight.
    pub fn enqueue(&self, path: &Path) -> bool {
        if !is_snapshot_file(path) {
            debug!(path = %path.display(), "ignoring non-snapshot file");
            return false;
        }
        let mut inflight = lock(&self.inflight);
        if !inflight.insert(path.to_path_buf()) {
            return false;
        }
        lock(&self.queue).push_back(path.to_path_buf());
        drop(inflight);
        self.ready.notify_one();
        true
    }

    pub fn next(&self, timeout: Duration) -> Option<PathBuf> {
        let mut queue = lock(&self.queue);
        if queue.is_empty() {
            queue = match self.ready.wait_timeout(queue, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        queue.pop_front()
    }

    /// Release a path from the dedup set after success or failure.
    pub fn complete(&self, path: &Path) {
        lock(&self.inflight).remove(path);
    }

    pub fn depth(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        lock(&self.inflight).contains(path)
    }

    fn handle(&self, processor: &dyn SnapshotProcessor, path: &Path) -> Option<ProcessOutcome> {
        let outcome = match processor.process(path) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "snapshot processing failed"
                );
                None
            }
        };
        self.complete(path);
        outcome
    }

    /// Process everything queued on the calling thread.
    pub fn drain(
        &self,
        processor: &dyn SnapshotProcessor,
    ) -> Vec<(PathBuf, Option<ProcessOutcome>)> {
        let mut results = Vec::new();
        loop {
            let Some(path) = lock(&self.queue).pop_front() else {
                break;
            };
            let outcome = self.handle(processor, &path);
            results.push((path, outcome));
        }
        results
    }

    pub fn spawn_worker(
        self: &Arc<Self>,
        processor: Arc<dyn SnapshotProcessor>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let intake = Arc::clone(self);
        thread::spawn(move || {
            info!("snapshot worker started");
            while !shutdown.load(Ordering::SeqCst) {
                if let Some(path) = intake.next(WORKER_POLL) {
                    intake.handle(processor.as_ref(), &path);
                }
            }
            info!("snapshot worker stopped");
        })
    }
}

fn capture_instant(path: &Path, tz: Tz) -> Option<DateTime<Utc>> {
    parse_capture_time(path, tz).or_else(|| modified_time(path).map(DateTime::<Utc>::from))
}

/// Enqueue snapshots newer than the progress marker, oldest capture first.
pub fn scan_new_snapshots(
    intake: &Intake,
    index: &SnapshotIndex,
    marker_path: &Path,
    tz: Tz,
) -> Result<usize> {
    let marker = read_last_processed(marker_path);
    let cutoff = marker
        .snapshot_time
        .as_deref()
        .or(marker.timestamp.as_deref())
        .and_then(parse_iso);

    index.invalidate();
    let mut pending: Vec<(DateTime<Utc>, PathBuf)> = index
        .list()?
        .into_iter()
        .filter_map(|path| capture_instant(&path, tz).map(|at| (at, path)))
        .filter(|(at, _)| cutoff.is_none_or(|cut| *at > cut))
        .collect();
    pending.sort();

    let mut queued = 0;
    for (_, path) in pending {
        if intake.enqueue(&path) {
            queued += 1;
        }
    }
    if queued > 0 {
        info!(queued, "backlog snapshots enqueued");
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snap::storage::{ProcessingMarker, write_last_processed};
    use std::fs;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<PathBuf>>,
        fail: bool,
    }

    impl SnapshotProcessor for Recorder {
        fn process(&self, path: &Path) -> Result<ProcessOutcome> {
            self.seen.lock().expect("seen").push(path.to_path_buf());
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(ProcessOutcome::Annotated { described: true })
        }
    }

    #[test]
    fn enqueue_rejects_duplicates_and_non_images() {
        let intake = Intake::new();
        let path = Path::new("/data/snapshots/2025/01/01/100000.jpg");
        assert!(intake.enqueue(path));
        assert!(!intake.enqueue(path));
        assert!(!intake.enqueue(Path::new("/data/snapshots/2025/01/01/100000.jpg.tmp")));
        assert!(!intake.enqueue(Path::new("/data/notes.txt")));
        assert!(intake.enqueue(Path::new("/data/snapshots/2025/01/01/100100.JPEG")));
        assert_eq!(intake.depth(), 2);
    }

    #[test]
    fn in_flight_path_stays_deduplicated_until_complete() {
        let intake = Intake::new();
        let path = Path::new("/s/2025/01/01/100000.png");
        assert!(intake.enqueue(path));
        let taken = intake.next(Duration::from_millis(10)).expect("queued");
        assert_eq!(taken, path);
        assert!(!intake.enqueue(path));
        intake.complete(path);
        assert!(intake.enqueue(path));
    }

    #[test]
    fn drain_processes_fifo_and_releases_failed_paths() {
        let intake = Intake::new();
        let a = PathBuf::from("/s/2025/01/01/100000.jpg");
        let b = PathBuf::from("/s/2025/01/01/100500.jpg");
        intake.enqueue(&a);
        intake.enqueue(&b);
        let recorder = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let results = intake.drain(&recorder);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, outcome)| outcome.is_none()));
        assert_eq!(*recorder.seen.lock().expect("seen"), vec![a.clone(), b]);
        assert!(!intake.is_tracked(&a));
    }

    #[test]
    fn worker_stops_on_shutdown_flag() {
        let intake = Arc::new(Intake::new());
        let recorder = Arc::new(Recorder::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = intake.spawn_worker(recorder.clone(), shutdown.clone());

        let path = PathBuf::from("/s/2025/01/01/120000.jpg");
        intake.enqueue(&path);
        for _ in 0..100 {
            if !intake.is_tracked(&path) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        shutdown.store(true, Ordering::SeqCst);
        handle.join().expect("worker join");
        assert_eq!(*recorder.seen.lock().expect("seen"), vec![path]);
    }

    #[test]
    fn scan_enqueues_only_snapshots_after_marker_in_capture_order() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path().join("snapshots");
        let day = root.join("2025/01/01");
        fs::create_dir_all(&day).expect("mkdir");
        for name in ["110000.jpg", "090000.jpg", "100000.jpg", "120000.jpg.tmp"] {
            fs::write(day.join(name), b"x").expect("write");
        }
        let marker_path = tmp.path().join("run/last_processed.json");
        write_last_processed(
            &marker_path,
            &ProcessingMarker {
                timestamp: Some("2025-01-01T12:30:00Z".into()),
                path: None,
                snapshot_time: Some("2025-01-01T09:00:00Z".into()),
            },
        )
        .expect("marker");

        let intake = Intake::new();
        let index = SnapshotIndex::new(&root);
        let queued = scan_new_snapshots(&intake, &index, &marker_path, Tz::UTC).expect("scan");
        assert_eq!(queued, 2);
        assert_eq!(intake.next(Duration::ZERO), Some(day.join("100000.jpg")));
        assert_eq!(intake.next(Duration::ZERO), Some(day.join("110000.jpg")));
        assert_eq!(intake.next(Duration::ZERO), None);

        // already queued or in flight: nothing new
        assert_eq!(scan_new_snapshots(&intake, &index, &marker_path, Tz::UTC).expect("rescan"), 0);
    }
}
