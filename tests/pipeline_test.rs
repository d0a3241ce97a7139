use anyhow::Result;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use lookout::error::ValidationReason;
use lookout::snap::config::LookoutConfig;
use lookout::snap::inspect::{FrameInspector, ImageLimits};
use lookout::snap::metrics::{Metrics, StorageReport};
use lookout::snap::paths::{ArtifactKind, LookoutPaths};
use lookout::snap::pipeline::{JobOutcome, Pipeline, PipelineParts, ProcessOutcome};
use lookout::snap::providers::{Comparator, Completion, Describer, TokenUsage};
use lookout::snap::rate_limiter::SystemClock;
use lookout::snap::record_store::{FetchOptions, RecordList, RecordStore};
use lookout::snap::snapshots::build_snapshot_path;
use lookout::snap::storage::read_last_processed;
use serde_json::json;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::{TempDir, tempdir};

/// Rejects any file whose name contains "bad"; diff is 0 for identical bytes.
struct FakeInspector;

impl FrameInspector for FakeInspector {
    fn validate_image(&self, path: &Path, _limits: &ImageLimits) -> Result<(), ValidationReason> {
        if !path.exists() {
            return Err(ValidationReason::FileMissing);
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.contains("bad") {
            return Err(ValidationReason::UnsupportedFormat);
        }
        Ok(())
    }

    fn is_dark_frame(&self, _path: &Path) -> bool {
        false
    }

    fn diff_percent(&self, a: &Path, b: &Path) -> Result<f64> {
        Ok(if fs::read(a)? == fs::read(b)? { 0.0 } else { 100.0 })
    }
}

#[derive(Default)]
struct FakeDescriber {
    calls: Arc<AtomicUsize>,
    fail: bool,
    fail_tags: bool,
}

fn usage() -> TokenUsage {
    TokenUsage {
        input: 120,
        output: 30,
        total: 150,
    }
}

impl Describer for FakeDescriber {
    fn provider(&self) -> &str {
        "groq"
    }

    fn model(&self) -> &str {
        "fake-vision"
    }

    fn describe(&self, _image: &Path, label: &str) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("upstream 503");
        }
        Ok(Completion {
            text: format!("A person walks a dog past the gate at {label}."),
            usage: usage(),
        })
    }

    fn extract_tags(&self, _description: &str) -> Result<Completion> {
        if self.fail_tags {
            anyhow::bail!("tagger timed out");
        }
        Ok(Completion {
            text: r#"Here you go: {"people": ["person"], "vehicles": [], "objects": ["dog"]}"#
                .to_string(),
            usage: usage(),
        })
    }
}

struct FakeComparator;

impl Comparator for FakeComparator {
    fn provider(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        "fake-compare"
    }

    fn compare(
        &self,
        _a: &Path,
        _b: &Path,
        label_a: &str,
        label_b: &str,
        cadence: &str,
    ) -> Result<Completion> {
        Ok(Completion {
            text: format!("{cadence}: a car left between {label_a} and {label_b}."),
            usage: usage(),
        })
    }

    fn summarize(&self, date: &str, _tags_summary: &str, lines: &[String]) -> Result<Completion> {
        Ok(Completion {
            text: json!({
                "summary": format!("Quiet day on {date} with {} notable changes.", lines.len()),
                "highlights": ["Car left the driveway", "Dog walker passed"],
            })
            .to_string(),
            usage: usage(),
        })
    }

    fn ask(
        &self,
        query: &str,
        _window_label: &str,
        tags_summary: &str,
        context: &str,
    ) -> Result<Completion> {
        let lines = context.lines().count();
        let shape = if query == query.trim() { "trimmed" } else { "padded" };
        Ok(Completion {
            text: format!(
                "{lines} sightings, {shape} question, tags {tags_summary}. {}",
                "x".repeat(500)
            ),
            usage: usage(),
        })
    }
}

struct Harness {
    _tmp: TempDir,
    cfg: LookoutConfig,
    paths: LookoutPaths,
    store: Arc<RecordStore>,
    metrics: Arc<Metrics>,
}

impl Harness {
    fn new(tweak: impl FnOnce(&mut LookoutConfig)) -> Self {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = LookoutConfig::default();
        cfg.data_dir = tmp.path().to_path_buf();
        cfg.camera.timezone = "UTC".to_string();
        cfg.pipeline.stability_delay_ms = 1;
        cfg.api.retry_max_attempts = 1;
        tweak(&mut cfg);
        let paths = LookoutPaths::new(tmp.path());
        paths.ensure_dirs().expect("dirs");
        let store = Arc::new(RecordStore::open(tmp.path()).expect("store"));
        Self {
            _tmp: tmp,
            cfg,
            paths,
            store,
            metrics: Arc::new(Metrics::new()),
        }
    }

    fn pipeline(&self, describer: FakeDescriber) -> Pipeline {
        Pipeline::new(
            self.cfg.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            PipelineParts {
                inspector: Box::new(FakeInspector),
                describer: Box::new(describer),
                comparator: Box::new(FakeComparator),
                clock: Arc::new(SystemClock),
            },
        )
    }

    /// Write a snapshot captured at `hour:minute` on 2025-06-01 with an
    /// mtime that keeps capture order.
    fn snapshot(&self, hour: u32, minute: u32, bytes: &[u8]) -> PathBuf {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).single().expect("time");
        let path = build_snapshot_path(&self.paths.snapshots_dir, at.with_timezone(&Tz::UTC));
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, bytes).expect("write snapshot");
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(at.timestamp() as u64);
        File::options()
            .write(true)
            .open(&path)
            .expect("open")
            .set_modified(mtime)
            .expect("set mtime");
        path
    }
}

#[test]
fn annotated_snapshot_is_recorded_mirrored_and_marked() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    let snap = h.snapshot(10, 0, b"frame-a");

    let outcome = pipeline.process(&snap).expect("process");
    assert_eq!(outcome, ProcessOutcome::Annotated { described: true });

    let records = h.store.fetch(RecordList::Descriptions, &FetchOptions::default()).expect("fetch");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["snapshot"], "snapshots/2025/06/01/100000.jpg");
    assert_eq!(records[0]["tags"]["people"], json!(["person"]));
    assert!(records[0]["latency_ms"].as_f64().is_some_and(|ms| ms >= 0.0));
    assert!(records[0]["text"].as_str().expect("text").contains("2025-06-01 10:00:00"));

    let artifact = h.paths.artifact_path(ArtifactKind::Descriptions, &snap).expect("artifact");
    assert!(artifact.is_file());

    // one usage record for the description and one for the tags
    assert_eq!(h.store.count(RecordList::Usage).expect("count"), 2);

    let marker = read_last_processed(&h.paths.last_processed());
    assert_eq!(marker.path.as_deref(), Some(snap.display().to_string().as_str()));
    assert_eq!(marker.snapshot_time.as_deref(), Some("2025-06-01T10:00:00Z"));
    assert_eq!(h.metrics.snapshots_processed(), 1);
}

#[test]
fn rejected_snapshot_leaves_no_record_and_no_marker() {
    let h = Harness::new(|_| {});
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = h.pipeline(FakeDescriber {
        calls: Arc::clone(&calls),
        ..FakeDescriber::default()
    });
    let day = h.paths.snapshots_dir.join("2025/06/01");
    fs::create_dir_all(&day).expect("mkdir");
    let bad = day.join("bad-frame.jpg");
    fs::write(&bad, b"garbage").expect("write");

    let outcome = pipeline.process(&bad).expect("process");
    assert_eq!(outcome, ProcessOutcome::Rejected(ValidationReason::UnsupportedFormat));
    assert!(!outcome.marked());
    assert!(!h.paths.last_processed().exists());
    assert_eq!(h.store.count(RecordList::Descriptions).expect("count"), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let missing = pipeline.process(&day.join("120000.jpg")).expect("process missing");
    assert_eq!(missing, ProcessOutcome::Missing);
    assert!(!h.paths.last_processed().exists());
}

#[test]
fn unchanged_frame_is_motion_skipped_but_marked() {
    let h = Harness::new(|cfg| {
        cfg.motion.enabled = true;
        cfg.motion.threshold = 5.0;
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = h.pipeline(FakeDescriber {
        calls: Arc::clone(&calls),
        ..FakeDescriber::default()
    });
    let first = h.snapshot(10, 0, b"same");
    let second = h.snapshot(10, 10, b"same");

    assert!(pipeline.process(&first).expect("first").marked());
    let outcome = pipeline.process(&second).expect("second");
    assert_eq!(outcome, ProcessOutcome::MotionSkipped { change: 0.0 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let marker = read_last_processed(&h.paths.last_processed());
    assert_eq!(marker.snapshot_time.as_deref(), Some("2025-06-01T10:10:00Z"));
    let report = h.metrics.report(
        StorageReport {
            disk_used_mb: 0.0,
            disk_free_mb: 1_000.0,
        },
        0,
        10,
    );
    assert_eq!(report.motion_skipped_total, 1);
    assert_eq!(report.snapshots_processed_total, 2);
}

#[test]
fn motion_reference_survives_a_restart() {
    let h = Harness::new(|cfg| {
        cfg.motion.enabled = true;
        cfg.motion.threshold = 5.0;
    });
    let first = h.snapshot(10, 0, b"same");
    let outcome = h.pipeline(FakeDescriber::default()).process(&first).expect("first");
    assert_eq!(outcome, ProcessOutcome::Annotated { described: true });

    let calls = Arc::new(AtomicUsize::new(0));
    let restarted = h.pipeline(FakeDescriber {
        calls: Arc::clone(&calls),
        ..FakeDescriber::default()
    });
    let second = h.snapshot(10, 10, b"same");
    let outcome = restarted.process(&second).expect("second");
    assert_eq!(outcome, ProcessOutcome::MotionSkipped { change: 0.0 });
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // a marked snapshot that is gone no longer serves as the reference
    fs::remove_file(&second).expect("remove");
    let third = h.snapshot(10, 20, b"same");
    let outcome = h.pipeline(FakeDescriber::default()).process(&third).expect("third");
    assert_eq!(outcome, ProcessOutcome::Annotated { described: true });
}

#[test]
fn rejected_frame_does_not_replace_the_motion_reference() {
    let h = Harness::new(|cfg| {
        cfg.motion.enabled = true;
        cfg.motion.threshold = 5.0;
    });
    let pipeline = h.pipeline(FakeDescriber::default());
    let first = h.snapshot(10, 0, b"same");
    let bad = h.paths.snapshots_dir.join("2025/06/01/bad-frame.jpg");
    fs::write(&bad, b"different").expect("write");
    let second = h.snapshot(10, 10, b"same");

    assert!(pipeline.process(&first).expect("first").marked());
    assert_eq!(
        pipeline.process(&bad).expect("bad"),
        ProcessOutcome::Rejected(ValidationReason::UnsupportedFormat)
    );
    assert_eq!(
        pipeline.process(&second).expect("second"),
        ProcessOutcome::MotionSkipped { change: 0.0 }
    );
    assert_eq!(h.store.count(RecordList::Descriptions).expect("count"), 1);
}

#[test]
fn tag_failure_keeps_the_description_with_empty_tags() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber {
        fail_tags: true,
        ..FakeDescriber::default()
    });
    let snap = h.snapshot(8, 0, b"frame");

    let outcome = pipeline.process(&snap).expect("process");
    assert_eq!(outcome, ProcessOutcome::Annotated { described: true });
    let records = h.store.fetch(RecordList::Descriptions, &FetchOptions::default()).expect("fetch");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0]["tags"],
        json!({"people": [], "vehicles": [], "objects": []})
    );
    // only the description call is billed
    assert_eq!(h.store.count(RecordList::Usage).expect("count"), 1);
    assert_eq!(h.metrics.api_stats("groq").failure, 1);
}

#[test]
fn failed_description_marks_without_a_record() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber {
        fail: true,
        ..FakeDescriber::default()
    });
    let snap = h.snapshot(9, 0, b"frame");
    let outcome = pipeline.process(&snap).expect("process");
    assert_eq!(outcome, ProcessOutcome::Annotated { described: false });
    assert_eq!(h.store.count(RecordList::Descriptions).expect("count"), 0);
    assert_eq!(h.store.count(RecordList::Usage).expect("count"), 0);
    assert!(h.paths.last_processed().exists());
    assert_eq!(h.metrics.api_stats("groq").failure, 1);
}

#[test]
fn compare_recent_skips_a_pair_it_already_compared() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    h.snapshot(10, 0, b"a");
    let newer = h.snapshot(10, 10, b"b");

    let JobOutcome::Done(record) = pipeline.compare_recent().expect("compare") else {
        panic!("expected a comparison");
    };
    assert_eq!(record.snapshot_b, "snapshots/2025/06/01/101000.jpg");
    assert!(record.text.chars().count() <= 200);
    assert!(record.latency_ms >= 0.0);
    assert!(h.paths.artifact_path(ArtifactKind::Compare10m, &newer).expect("artifact").is_file());

    assert_eq!(
        pipeline.compare_recent().expect("again"),
        JobOutcome::Skipped("latest pair already compared")
    );
    assert_eq!(h.store.count(RecordList::Compare10m).expect("count"), 1);
}

#[test]
fn compare_hourly_picks_the_snapshot_nearest_an_hour_back() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    h.snapshot(9, 0, b"a");
    h.snapshot(10, 50, b"b");
    h.snapshot(11, 30, b"c");
    h.snapshot(12, 0, b"d");

    let JobOutcome::Done(record) = pipeline.compare_hourly().expect("compare") else {
        panic!("expected a comparison");
    };
    assert_eq!(record.snapshot_a, "snapshots/2025/06/01/105000.jpg");
    assert_eq!(record.snapshot_b, "snapshots/2025/06/01/120000.jpg");
    assert_eq!(h.store.count(RecordList::CompareHourly).expect("count"), 1);
}

#[test]
fn compare_hourly_skips_without_a_nearby_snapshot() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    h.snapshot(6, 0, b"a");
    h.snapshot(12, 0, b"b");
    assert!(matches!(pipeline.compare_hourly().expect("compare"), JobOutcome::Skipped(_)));
    assert_eq!(h.store.count(RecordList::CompareHourly).expect("count"), 0);
}

#[test]
fn compare_custom_rejects_missing_files() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    let a = h.snapshot(10, 0, b"a");
    let err = pipeline
        .compare_custom(&a, &h.paths.snapshots_dir.join("nope.jpg"))
        .expect_err("missing file");
    assert!(format!("{err:#}").contains("nope.jpg"));

    let b = h.snapshot(10, 5, b"b");
    assert!(matches!(pipeline.compare_custom(&a, &b).expect("custom"), JobOutcome::Done(_)));
    assert_eq!(h.store.count(RecordList::CompareCustom).expect("count"), 1);
}

#[test]
fn daily_report_summarizes_the_last_day() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());
    assert!(matches!(pipeline.daily_report().expect("empty"), JobOutcome::Skipped(_)));

    let now = lookout::snap::util::now_utc_iso();
    h.store
        .append(
            RecordList::CompareHourly,
            &json!({"timestamp": now, "snapshot_a": "a", "snapshot_b": "b", "text": "A car left."}),
        )
        .expect("hourly");
    h.store
        .append(
            RecordList::Descriptions,
            &json!({
                "timestamp": now,
                "snapshot": "s",
                "text": "t",
                "tags": {"vehicles": ["car", "Car"]}
            }),
        )
        .expect("description");

    let JobOutcome::Done(report) = pipeline.daily_report().expect("report") else {
        panic!("expected a report");
    };
    assert!(report.summary.starts_with("Quiet day on"));
    assert_eq!(report.highlights.len(), 2);
    assert_eq!(report.tags["vehicles"], vec![("car".to_string(), 2)]);
    assert!(h.paths.daily_report_path(&report.date).is_file());
    assert_eq!(h.store.count(RecordList::DailyReports).expect("count"), 1);
}

#[test]
fn ask_answers_from_recent_descriptions() {
    let h = Harness::new(|_| {});
    let pipeline = h.pipeline(FakeDescriber::default());

    let JobOutcome::Done(empty) = pipeline.ask("any cars?", 6, 40).expect("empty window") else {
        panic!("expected an answer");
    };
    assert_eq!(empty.answer, "No snapshots in the last 6 hours.");
    assert_eq!(empty.window.items, 0);
    assert_eq!(h.store.count(RecordList::Usage).expect("count"), 0);

    let now = Utc::now();
    let seeded = [
        (30 * 60, "Old sighting."),
        (150, "A car pulls in."),
        (20, "The car is parked."),
    ];
    for (minutes_ago, text) in seeded {
        h.store
            .append(
                RecordList::Descriptions,
                &json!({
                    "timestamp": (now - chrono::Duration::minutes(minutes_ago)).to_rfc3339(),
                    "snapshot": "s",
                    "text": text,
                    "tags": {"vehicles": ["car"]},
                }),
            )
            .expect("description");
    }

    let JobOutcome::Done(answer) = pipeline.ask("  any cars?  ", 0, 500).expect("ask") else {
        panic!("expected an answer");
    };
    assert_eq!(answer.answer, "1 sightings, trimmed question, tags vehicles: car(1).");
    assert_eq!(answer.window.lookback_hours, 1);
    assert_eq!(answer.window.items, 1);
    assert!(answer.window.label.is_some());

    let JobOutcome::Done(wide) = pipeline.ask("any cars?", 24, 40).expect("ask") else {
        panic!("expected an answer");
    };
    assert_eq!(wide.window.items, 2);

    let usage = h.store.fetch(RecordList::Usage, &FetchOptions::default()).expect("usage");
    assert_eq!(usage.len(), 2);
    assert!(usage.iter().all(|r| r["endpoint"] == "ask" && r["provider"] == "gemini"));

    assert!(pipeline.ask("   ", 24, 40).is_err());
}
