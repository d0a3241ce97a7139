use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
///
/// Every record and marker timestamp goes through this helper so the stored
/// format stays uniform.
pub fn now_utc_iso() -> String {
    to_utc_iso(Utc::now())
}

pub fn to_utc_iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an ISO-8601 timestamp. Offsets and `Z` are honoured; a naive value
/// is taken as UTC.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

pub fn epoch_secs_f64(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

/// Collapse whitespace and shorten `text` to at most `limit` characters,
/// keeping whole sentences when at least one fits.
pub fn safe_truncate(text: &str, limit: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= limit {
        return cleaned;
    }
    if limit == 0 {
        return String::new();
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut kept_len = 0usize;
    for sentence in cleaned.split(['.', '!', '?']).map(str::trim) {
        if sentence.is_empty() {
            continue;
        }
        let sentence_len = sentence.chars().count();
        // joined with ". " plus the closing period
        let candidate = if kept.is_empty() {
            sentence_len + 1
        } else {
            kept_len + 2 + sentence_len + 1
        };
        if candidate > limit {
            break;
        }
        kept_len = candidate - 1;
        kept.push(sentence);
    }
    if !kept.is_empty() {
        return format!("{}.", kept.join(". "));
    }

    let head: String = cleaned.chars().take(limit - 1).collect();
    let cut = match head.rfind(' ') {
        Some(idx) if idx > 0 => &head[..idx],
        _ => head.as_str(),
    };
    format!("{}.", cut.trim_end())
}

/// Snapshot path relative to the data dir with `/` separators, or the full
/// path when it lives elsewhere.
pub fn relative_display(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.display().to_string(),
    }
}

pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout_secs: Option<u64>,
) -> Result<Output> {
    let Some(timeout_secs) = timeout_secs else {
        return Ok(cmd.output()?);
    };
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    let mut child = cmd.spawn()?;
    let started = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("command timed out after {}s", timeout_secs);
        }
        thread::sleep(Duration::from_millis(50));
    }
}
