use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::snap::storage::atomic_write_json;
use crate::snap::util::{now_utc_iso, parse_iso};

const UNHEALTHY_FREE_MB: f64 = 100.0;
const DEGRADED_QUEUE_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ApiCallStats {
    pub success: u64,
    pub failure: u64,
    pub latency_total_ms: f64,
}

impl ApiCallStats {
    pub fn avg_latency_ms(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.latency_total_ms / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    snapshots_processed_total: u64,
    motion_skipped_total: u64,
    last_snapshot_time: Option<String>,
    last_success: BTreeMap<String, String>,
    last_failure: BTreeMap<String, String>,
    api_calls: BTreeMap<String, ApiCallStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiCallReport {
    pub success: u64,
    pub failure: u64,
    pub avg_latency_ms: f64,
    pub last_success: Option<String>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageReport {
    pub disk_used_mb: f64,
    pub disk_free_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub snapshots_processed_total: u64,
    pub motion_skipped_total: u64,
    pub queue_depth: usize,
    pub api_calls: BTreeMap<String, ApiCallReport>,
    pub storage: StorageReport,
    pub last_snapshot: Option<String>,
    pub status: HealthStatus,
}

/// Process-wide counters shared by the worker and scheduled jobs.
#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    state: Mutex<MetricsState>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_snapshot(&self, at_iso: &str) {
        let mut state = self.lock();
        state.snapshots_processed_total += 1;
        state.last_snapshot_time = Some(at_iso.to_string());
    }

    pub fn record_motion_skip(&self) {
        self.lock().motion_skipped_total += 1;
    }

    pub fn record_api_call(&self, provider: &str, success: bool, latency_ms: f64) {
        let now = now_utc_iso();
        let mut state = self.lock();
        let stats = state.api_calls.entry(provider.to_string()).or_default();
        if success {
            stats.success += 1;
        } else {
            stats.failure += 1;
        }
        stats.latency_total_ms += latency_ms;
        if success {
            state.last_success.insert(provider.to_string(), now);
        } else {
            state.last_failure.insert(provider.to_string(), now);
        }
    }

    pub fn snapshots_processed(&self) -> u64 {
        self.lock().snapshots_processed_total
    }

    pub fn api_stats(&self, provider: &str) -> ApiCallStats {
        self.lock()
            .api_calls
            .get(provider)
            .copied()
            .unwrap_or_default()
    }

    pub fn last_snapshot_time(&self) -> Option<String> {
        self.lock().last_snapshot_time.clone()
    }

    pub fn report(
        &self,
        storage: StorageReport,
        queue_depth: usize,
        capture_interval_min: u64,
    ) -> MetricsReport {
        let state = self.lock();
        let api_calls = state
            .api_calls
            .iter()
            .map(|(provider, stats)| {
                (
                    provider.clone(),
                    ApiCallReport {
                        success: stats.success,
                        failure: stats.failure,
                        avg_latency_ms: (stats.avg_latency_ms() * 100.0).round() / 100.0,
                        last_success: state.last_success.get(provider).cloned(),
                        last_failure: state.last_failure.get(provider).cloned(),
                    },
                )
            })
            .collect();
        MetricsReport {
            timestamp: now_utc_iso(),
            uptime_seconds: self.started.elapsed().as_secs(),
            snapshots_processed_total: state.snapshots_processed_total,
            motion_skipped_total: state.motion_skipped_total,
            queue_depth,
            api_calls,
            storage,
            last_snapshot: state.last_snapshot_time.clone(),
            status: health_status(
                state.last_snapshot_time.as_deref(),
                storage.disk_free_mb,
                queue_depth,
                capture_interval_min,
            ),
        }
    }
}

pub fn storage_report(data_dir: &Path) -> StorageReport {
    let to_mb = |bytes: u64| ((bytes as f64 / (1024.0 * 1024.0)) * 100.0).round() / 100.0;
    let free = fs2::available_space(data_dir).unwrap_or(0);
    let total = fs2::total_space(data_dir).unwrap_or(0);
    StorageReport {
        disk_used_mb: to_mb(total.saturating_sub(free)),
        disk_free_mb: to_mb(free),
    }
}

/// Unhealthy when disk is nearly full; degraded when snapshots are stale
/// (older than two capture intervals) or the queue is backing up.
pub fn health_status(
    last_snapshot_time: Option<&str>,
    disk_free_mb: f64,
    queue_depth: usize,
    capture_interval_min: u64,
) -> HealthStatus {
    if disk_free_mb < UNHEALTHY_FREE_MB {
        return HealthStatus::Unhealthy;
    }
    let Some(last) = last_snapshot_time.and_then(parse_iso) else {
        return HealthStatus::Degraded;
    };
    let age_secs = (Utc::now() - last).num_seconds();
    let max_age = i64::try_from(capture_interval_min.saturating_mul(120)).unwrap_or(i64::MAX);
    if age_secs > max_age || queue_depth > DEGRADED_QUEUE_DEPTH {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

pub fn write_heartbeat(path: &Path, report: &MetricsReport) -> Result<()> {
    atomic_write_json(path, report)
}
