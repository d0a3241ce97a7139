//! Snapshot processing: stability check, validation, motion gate, annotation,
//! comparison jobs, the daily report and questions over recent descriptions.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LookoutError, ValidationReason};
use crate::snap::config::LookoutConfig;
use crate::snap::inspect::{FrameInspector, HeaderInspector, ImageLimits};
use crate::snap::metrics::Metrics;
use crate::snap::paths::{ArtifactKind, LookoutPaths};
use crate::snap::prompts::PROMPT_VERSION;
use crate::snap::providers::{Comparator, Completion, Describer, GeminiClient, GroqClient};
use crate::snap::rate_limiter::{Clock, RateLimiter, SystemClock};
use crate::snap::record_store::{RecordList, RecordStore};
use crate::snap::records::{
    AskAnswer, AskWindow, CompareRecord, DailyReport, DescriptionRecord, Tags,
};
use crate::snap::snapshots::{SnapshotIndex, find_nearest, parse_capture_time, snapshot_label};
use crate::snap::storage::{
    FileLock, ProcessingMarker, atomic_write_json, read_last_processed, write_last_processed,
};
use crate::snap::tags::{
    aggregate_tags, extract_json_object, format_tags_compact, format_tags_summary, normalize_tags,
    parse_daily_response,
};
use crate::snap::usage::record_usage;
use crate::snap::util::{now_utc_iso, parse_iso, safe_truncate, to_utc_iso};

const COMPARE_MAX_CHARS: usize = 200;
const DAILY_SUMMARY_MAX_CHARS: usize = 500;
const HIGHLIGHT_MAX_CHARS: usize = 140;
const MAX_HIGHLIGHTS: usize = 3;
const ASK_ANSWER_MAX_CHARS: usize = 400;
const ASK_LINE_MAX_CHARS: usize = 160;
pub const ASK_MAX_LOOKBACK_HOURS: u64 = 168;
pub const ASK_MAX_ITEMS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Missing,
    Unstable,
    Rejected(ValidationReason),
    DarkFrame,
    MotionSkipped { change: f64 },
    Annotated { described: bool },
}

impl ProcessOutcome {
    /// True when the progress marker was advanced.
    pub fn marked(&self) -> bool {
        matches!(self, Self::MotionSkipped { .. } | Self::Annotated { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Skipped(&'static str),
    Failed,
    Done(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    TenMinute,
    Hourly,
    Custom,
}

impl Cadence {
    fn label(self) -> &'static str {
        match self {
            Self::TenMinute => "10-minute",
            Self::Hourly => "hourly",
            Self::Custom => "custom",
        }
    }

    fn list(self) -> RecordList {
        match self {
            Self::TenMinute => RecordList::Compare10m,
            Self::Hourly => RecordList::CompareHourly,
            Self::Custom => RecordList::CompareCustom,
        }
    }

    fn artifact(self) -> Option<ArtifactKind> {
        match self {
            Self::TenMinute => Some(ArtifactKind::Compare10m),
            Self::Hourly => Some(ArtifactKind::CompareHourly),
            Self::Custom => None,
        }
    }
}

/// Stable iff the size is non-zero and unchanged between two polls.
pub fn ensure_stable_file(path: &Path, attempts: u32, delay: Duration) -> bool {
    let mut last_size: Option<u64> = None;
    for _ in 0..attempts.max(1) {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let size = meta.len();
        if size > 0 && last_size == Some(size) {
            return true;
        }
        last_size = Some(size);
        thread::sleep(delay);
    }
    false
}

#[derive(Debug)]
struct PipelineState {
    last_seen: Option<PathBuf>,
    last_compared: Option<(PathBuf, PathBuf)>,
}

/// Collaborators the pipeline calls out to.
pub struct PipelineParts {
    pub inspector: Box<dyn FrameInspector>,
    pub describer: Box<dyn Describer>,
    pub comparator: Box<dyn Comparator>,
    pub clock: Arc<dyn Clock>,
}

impl PipelineParts {
    /// Header inspector plus the Groq and Gemini clients; needs both API keys.
    pub fn from_config(cfg: &LookoutConfig) -> Result<Self> {
        Ok(Self {
            inspector: Box::new(HeaderInspector),
            describer: Box::new(GroqClient::new(&cfg.groq, &cfg.api)?),
            comparator: Box::new(GeminiClient::new(&cfg.gemini, &cfg.api)?),
            clock: Arc::new(SystemClock),
        })
    }
}

pub struct Pipeline {
    cfg: LookoutConfig,
    paths: LookoutPaths,
    store: Arc<RecordStore>,
    metrics: Arc<Metrics>,
    index: SnapshotIndex,
    inspector: Box<dyn FrameInspector>,
    describer: Box<dyn Describer>,
    comparator: Box<dyn Comparator>,
    describe_limiter: RateLimiter,
    compare_limiter: RateLimiter,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    pub fn new(
        cfg: LookoutConfig,
        store: Arc<RecordStore>,
        metrics: Arc<Metrics>,
        parts: PipelineParts,
    ) -> Self {
        let paths = LookoutPaths::new(&cfg.data_dir);
        let describe_limiter = RateLimiter::with_clock(
            parts.describer.provider(),
            cfg.limiter_config(cfg.groq.rate_limit_rpm),
            parts.clock.clone(),
        );
        let compare_limiter = RateLimiter::with_clock(
            parts.comparator.provider(),
            cfg.limiter_config(cfg.gemini.rate_limit_rpm),
            parts.clock,
        );
        let state = PipelineState {
            last_seen: resume_reference(&paths),
            last_compared: None,
        };
        Self {
            index: SnapshotIndex::new(&paths.snapshots_dir),
            paths,
            cfg,
            store,
            metrics,
            inspector: parts.inspector,
            describer: parts.describer,
            comparator: parts.comparator,
            describe_limiter,
            compare_limiter,
            state: Mutex::new(state),
        }
    }

    pub fn index(&self) -> &SnapshotIndex {
        &self.index
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take one snapshot through the pipeline under the processing lock.
    pub fn process(&self, path: &Path) -> Result<ProcessOutcome> {
        let _guard = FileLock::exclusive(&self.paths.processing_lock())?;

        if !path.exists() {
            debug!(path = %path.display(), "snapshot vanished before processing");
            return Ok(ProcessOutcome::Missing);
        }
        let delay = Duration::from_millis(self.cfg.pipeline.stability_delay_ms);
        if !ensure_stable_file(path, self.cfg.pipeline.stability_attempts, delay) {
            warn!(path = %path.display(), "snapshot file not stable yet");
            return Ok(ProcessOutcome::Unstable);
        }
        let limits = ImageLimits::from_config(&self.cfg);
        if let Err(reason) = self.inspector.validate_image(path, &limits) {
            warn!(path = %path.display(), reason = reason.as_str(), "invalid image");
            return Ok(ProcessOutcome::Rejected(reason));
        }
        if self.cfg.images.dark_frame_check && self.inspector.is_dark_frame(path) {
            warn!(path = %path.display(), "dark frame detected, skipping");
            return Ok(ProcessOutcome::DarkFrame);
        }

        let previous = self.lock_state().last_seen.replace(path.to_path_buf());
        if self.cfg.motion.enabled {
            if let Some(previous) = previous.filter(|p| p.exists() && p != path) {
                match self.inspector.diff_percent(&previous, path) {
                    Ok(change) if change < self.cfg.motion.threshold => {
                        let at = now_utc_iso();
                        self.metrics.record_snapshot(&at);
                        self.metrics.record_motion_skip();
                        info!(path = %path.display(), change, "motion below threshold, skipping");
                        self.mark_processed(path, &at)?;
                        return Ok(ProcessOutcome::MotionSkipped { change });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            error = %format!("{err:#}"),
                            "motion diff failed"
                        );
                    }
                }
            }
        }

        let at = now_utc_iso();
        self.metrics.record_snapshot(&at);
        let described = self.annotate(path, &at)?;
        self.mark_processed(path, &at)?;
        Ok(ProcessOutcome::Annotated { described })
    }

    fn annotate(&self, path: &Path, at: &str) -> Result<bool> {
        let label = snapshot_label(path, self.cfg.tz());
        let outcome = self
            .describe_limiter
            .call_with_retry(|| self.describer.describe(path, &label));
        let latency_ms = outcome.latency_ms();
        self.metrics
            .record_api_call(self.describer.provider(), outcome.value.is_some(), latency_ms);
        let Some(completion) = outcome.value else {
            warn!(path = %path.display(), "description failed; no record written");
            return Ok(false);
        };
        self.usage(self.describer.provider(), self.describer.model(), "description", &completion)?;

        let tags = if self.cfg.pipeline.tagging_enabled {
            self.extract_tags(&completion.text)?
        } else {
            Tags::default()
        };

        let record = DescriptionRecord {
            timestamp: at.to_string(),
            snapshot: self.paths.display(path),
            text: completion.text,
            tags,
            provider: self.describer.provider().to_string(),
            model: self.describer.model().to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
            latency_ms: round2(latency_ms),
        };
        self.write_artifact(ArtifactKind::Descriptions, path, &record)?;
        self.store.append(RecordList::Descriptions, &record)?;
        info!(snapshot = %record.snapshot, "description recorded");
        Ok(true)
    }

    fn extract_tags(&self, description: &str) -> Result<Tags> {
        let outcome = self
            .describe_limiter
            .call_with_retry(|| self.describer.extract_tags(description));
        self.metrics.record_api_call(
            self.describer.provider(),
            outcome.value.is_some(),
            outcome.latency_ms(),
        );
        let Some(completion) = outcome.value else {
            return Ok(Tags::default());
        };
        self.usage(self.describer.provider(), self.describer.model(), "tags", &completion)?;
        Ok(normalize_tags(extract_json_object(&completion.text).as_ref()))
    }

    fn usage(
        &self,
        provider: &str,
        model: &str,
        endpoint: &str,
        completion: &Completion,
    ) -> Result<()> {
        record_usage(&self.store, &self.cfg, provider, model, endpoint, completion.usage)?;
        Ok(())
    }

    fn write_artifact<T: serde::Serialize>(
        &self,
        kind: ArtifactKind,
        snapshot: &Path,
        doc: &T,
    ) -> Result<()> {
        match self.paths.artifact_path(kind, snapshot) {
            Some(target) => atomic_write_json(&target, doc),
            None => {
                debug!(
                    path = %snapshot.display(),
                    "snapshot outside snapshots dir; artifact not mirrored"
                );
                Ok(())
            }
        }
    }

    fn mark_processed(&self, path: &Path, at: &str) -> Result<()> {
        let marker = ProcessingMarker {
            timestamp: Some(at.to_string()),
            path: Some(path.display().to_string()),
            snapshot_time: parse_capture_time(path, self.cfg.tz()).map(to_utc_iso),
        };
        write_last_processed(&self.paths.last_processed(), &marker)
    }

    fn compare_pair(
        &self,
        a: &Path,
        b: &Path,
        cadence: Cadence,
    ) -> Result<JobOutcome<CompareRecord>> {
        let tz = self.cfg.tz();
        let (label_a, label_b) = (snapshot_label(a, tz), snapshot_label(b, tz));
        let outcome = self.compare_limiter.call_with_retry(|| {
            self.comparator
                .compare(a, b, &label_a, &label_b, cadence.label())
        });
        let latency_ms = outcome.latency_ms();
        self.metrics
            .record_api_call(self.comparator.provider(), outcome.value.is_some(), latency_ms);
        let Some(completion) = outcome.value else {
            warn!(cadence = cadence.label(), "comparison failed; no record written");
            return Ok(JobOutcome::Failed);
        };
        self.usage(
            self.comparator.provider(),
            self.comparator.model(),
            cadence.list().as_str(),
            &completion,
        )?;

        if completion.text.chars().count() > COMPARE_MAX_CHARS {
            debug!(cadence = cadence.label(), "truncating comparison output");
        }
        let record = CompareRecord {
            timestamp: now_utc_iso(),
            snapshot_a: self.paths.display(a),
            snapshot_b: self.paths.display(b),
            text: safe_truncate(&completion.text, COMPARE_MAX_CHARS),
            provider: self.comparator.provider().to_string(),
            model: self.comparator.model().to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
            latency_ms: round2(latency_ms),
        };
        if let Some(kind) = cadence.artifact() {
            self.write_artifact(kind, b, &record)?;
        }
        self.store.append(cadence.list(), &record)?;
        info!(
            cadence = cadence.label(),
            a = %record.snapshot_a,
            b = %record.snapshot_b,
            "comparison recorded"
        );
        Ok(JobOutcome::Done(record))
    }

    /// Compare the two most recent snapshots unless that pair was already done.
    pub fn compare_recent(&self) -> Result<JobOutcome<CompareRecord>> {
        let snaps = self.index.list()?;
        if snaps.len() < 2 {
            return Ok(JobOutcome::Skipped("fewer than two snapshots"));
        }
        let pair = (snaps[snaps.len() - 2].clone(), snaps[snaps.len() - 1].clone());
        if self.lock_state().last_compared.as_ref() == Some(&pair) {
            return Ok(JobOutcome::Skipped("latest pair already compared"));
        }
        let outcome = self.compare_pair(&pair.0, &pair.1, Cadence::TenMinute)?;
        if matches!(outcome, JobOutcome::Done(_)) {
            self.lock_state().last_compared = Some(pair);
        }
        Ok(outcome)
    }

    /// Compare the latest snapshot with the one nearest an hour earlier.
    pub fn compare_hourly(&self) -> Result<JobOutcome<CompareRecord>> {
        let snaps = self.index.list()?;
        let Some(latest) = snaps.last().cloned() else {
            return Ok(JobOutcome::Skipped("no snapshots"));
        };
        let tz = self.cfg.tz();
        let Some(latest_at) = parse_capture_time(&latest, tz) else {
            return Ok(JobOutcome::Skipped("latest snapshot has no capture time"));
        };
        let Some(earlier) = find_nearest(
            &snaps,
            latest_at - ChronoDuration::hours(1),
            tz,
            ChronoDuration::hours(2),
            Some(&latest),
        ) else {
            return Ok(JobOutcome::Skipped("no snapshot near one hour earlier"));
        };
        self.compare_pair(&earlier, &latest, Cadence::Hourly)
    }

    /// On-demand comparison of two arbitrary snapshots.
    pub fn compare_custom(&self, a: &Path, b: &Path) -> Result<JobOutcome<CompareRecord>> {
        for path in [a, b] {
            if !path.is_file() {
                return Err(LookoutError::SnapshotPathRejected(path.display().to_string()).into());
            }
        }
        self.compare_pair(a, b, Cadence::Custom)
    }

    /// Answer a question from the descriptions of the last `lookback_hours`.
    /// The window and item count are clamped to 1..=168 hours and 1..=200.
    pub fn ask(
        &self,
        query: &str,
        lookback_hours: u64,
        max_items: usize,
    ) -> Result<JobOutcome<AskAnswer>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(LookoutError::EmptyQuestion.into());
        }
        let lookback_hours = lookback_hours.clamp(1, ASK_MAX_LOOKBACK_HOURS);
        let max_items = max_items.clamp(1, ASK_MAX_ITEMS);
        let cutoff = Utc::now() - ChronoDuration::hours(lookback_hours as i64);
        let items = self
            .store
            .fetch_since(RecordList::Descriptions, cutoff)
            .context("failed to load descriptions")?;
        let unanswered = |answer: String| AskAnswer {
            timestamp: now_utc_iso(),
            answer,
            window: AskWindow {
                label: None,
                lookback_hours,
                items: 0,
            },
        };
        if items.is_empty() {
            let answer = format!("No snapshots in the last {lookback_hours} hours.");
            return Ok(JobOutcome::Done(unanswered(answer)));
        }
        let context = ask_context(&items, max_items, self.cfg.tz());
        if context.lines.is_empty() {
            let answer = "No descriptions available in the selected window.".to_string();
            return Ok(JobOutcome::Done(unanswered(answer)));
        }

        let outcome = self.compare_limiter.call_with_retry(|| {
            self.comparator.ask(
                query,
                &context.window_label,
                &context.tags_summary,
                &context.lines.join("\n"),
            )
        });
        self.metrics.record_api_call(
            self.comparator.provider(),
            outcome.value.is_some(),
            outcome.latency_ms(),
        );
        let Some(completion) = outcome.value else {
            warn!(lookback_hours, "ask failed; no answer");
            return Ok(JobOutcome::Failed);
        };
        self.usage(self.comparator.provider(), self.comparator.model(), "ask", &completion)?;
        debug!(items = context.lines.len(), window = %context.window_label, "question answered");
        Ok(JobOutcome::Done(AskAnswer {
            timestamp: now_utc_iso(),
            answer: safe_truncate(&completion.text, ASK_ANSWER_MAX_CHARS),
            window: AskWindow {
                label: Some(context.window_label),
                lookback_hours,
                items: context.lines.len(),
            },
        }))
    }

    /// Summarize the last day of hourly comparisons and tags.
    pub fn daily_report(&self) -> Result<JobOutcome<DailyReport>> {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let hourly = self
            .store
            .fetch_since(RecordList::CompareHourly, cutoff)
            .context("failed to load hourly comparisons")?;
        if hourly.is_empty() {
            return Ok(JobOutcome::Skipped("no hourly comparisons in the last day"));
        }
        let descriptions = self.store.fetch_since(RecordList::Descriptions, cutoff)?;
        let tag_counts = aggregate_tags(&descriptions);
        let tags_summary = format_tags_summary(&tag_counts);
        let lines: Vec<String> = hourly
            .iter()
            .filter_map(|r| r.get("text").and_then(|t| t.as_str()))
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .collect();
        let date = Utc::now().with_timezone(&self.cfg.tz()).format("%Y-%m-%d").to_string();

        let outcome = self
            .compare_limiter
            .call_with_retry(|| self.comparator.summarize(&date, &tags_summary, &lines));
        self.metrics.record_api_call(
            self.comparator.provider(),
            outcome.value.is_some(),
            outcome.latency_ms(),
        );
        let Some(completion) = outcome.value else {
            warn!(date = %date, "daily summary failed; no report written");
            return Ok(JobOutcome::Failed);
        };
        self.usage(
            self.comparator.provider(),
            self.comparator.model(),
            "daily_report",
            &completion,
        )?;

        let (summary, highlights) = parse_daily_response(&completion.text);
        let summary = safe_truncate(&summary, DAILY_SUMMARY_MAX_CHARS);
        if summary.is_empty() {
            return Ok(JobOutcome::Failed);
        }
        let highlights = highlights
            .iter()
            .map(|h| safe_truncate(h, HIGHLIGHT_MAX_CHARS))
            .take(MAX_HIGHLIGHTS)
            .collect();
        let report = DailyReport {
            timestamp: now_utc_iso(),
            date: date.clone(),
            summary: summary.clone(),
            text: summary,
            highlights,
            tags: tag_counts,
            provider: self.comparator.provider().to_string(),
            model: self.comparator.model().to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
        };
        atomic_write_json(&self.paths.daily_report_path(&date), &report)?;
        self.store.append(RecordList::DailyReports, &report)?;
        info!(date = %date, "daily report written");
        Ok(JobOutcome::Done(report))
    }
}

/// Motion reference carried over from the last marked snapshot, if it is
/// still on disk.
fn resume_reference(paths: &LookoutPaths) -> Option<PathBuf> {
    read_last_processed(&paths.last_processed())
        .path
        .map(PathBuf::from)
        .filter(|path| path.is_file())
}

/// Prompt material for one question: one line per description, oldest
/// first, plus the covered time span and tag counts.
#[derive(Debug, Clone, PartialEq)]
struct AskContext {
    lines: Vec<String>,
    window_label: String,
    tags_summary: String,
}

fn ask_context(items: &[Value], max_items: usize, tz: Tz) -> AskContext {
    let mut dated: Vec<(Option<DateTime<Utc>>, &Value)> = items
        .iter()
        .map(|item| {
            let at = item.get("timestamp").and_then(Value::as_str).and_then(parse_iso);
            (at, item)
        })
        .collect();
    dated.sort_by_key(|(at, _)| *at);
    let window = &dated[dated.len().saturating_sub(max_items)..];

    let mut lines = Vec::new();
    for (at, item) in window {
        let text = item.get("text").and_then(Value::as_str).unwrap_or_default().trim();
        if text.is_empty() {
            continue;
        }
        let when = match at {
            Some(at) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string(),
            None => item
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or("unknown time")
                .to_string(),
        };
        let mut line = format!("- {when}: {}", safe_truncate(text, ASK_LINE_MAX_CHARS));
        let tags = format_tags_compact(item.get("tags"));
        if tags != "none" {
            line.push_str(&format!(" (tags: {tags})"));
        }
        lines.push(line);
    }

    let times: Vec<DateTime<Tz>> = window
        .iter()
        .filter_map(|(at, _)| at.map(|at| at.with_timezone(&tz)))
        .collect();
    let window_label = match (times.iter().min(), times.iter().max()) {
        (Some(start), Some(end)) if start.date_naive() == end.date_naive() => format!(
            "{} {} - {}",
            start.format("%Y-%m-%d"),
            start.format("%H:%M"),
            end.format("%H:%M")
        ),
        (Some(start), Some(end)) => format!(
            "{} - {}",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%Y-%m-%d %H:%M")
        ),
        _ => "recent snapshots".to_string(),
    };
    let sliced: Vec<Value> = window.iter().map(|(_, item)| (*item).clone()).collect();
    AskContext {
        lines,
        window_label,
        tags_summary: format_tags_summary(&aggregate_tags(&sliced)),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
