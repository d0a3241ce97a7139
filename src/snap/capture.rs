//! Pulling frames from HTTP or RTSP cameras into the snapshots tree.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::error::LookoutError;
use crate::snap::config::{CameraSource, LookoutConfig};
use crate::snap::paths::LookoutPaths;
use crate::snap::snapshots::build_snapshot_path;
use crate::snap::util::run_command_with_optional_timeout;

const HTTP_CAPTURE_TIMEOUT_SECS: u64 = 30;
const RTSP_CAPTURE_TIMEOUT_SECS: u64 = 30;

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct Capturer {
    cfg: LookoutConfig,
    paths: LookoutPaths,
    client: Client,
    last_preview: Mutex<Option<Instant>>,
}

impl Capturer {
    pub fn new(cfg: &LookoutConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_CAPTURE_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            paths: LookoutPaths::new(&cfg.data_dir),
            cfg: cfg.clone(),
            client,
            last_preview: Mutex::new(None),
        })
    }

    pub fn source(&self) -> CameraSource {
        self.cfg.camera.source
    }

    /// Capture one frame into its time-named slot and return the final path.
    pub fn capture_snapshot(&self) -> Result<PathBuf> {
        let local = Utc::now().with_timezone(&self.cfg.tz());
        let target = build_snapshot_path(&self.paths.snapshots_dir, local);
        self.capture_into(&target)?;
        info!(path = %target.display(), "snapshot captured");
        Ok(target)
    }

    /// Fresh preview frame, or the cached one within the cooldown.
    pub fn capture_preview(&self) -> Result<PathBuf> {
        let target = self.paths.preview_file();
        let cooldown = Duration::from_secs(self.cfg.camera.preview_cooldown_sec);
        let mut last = self
            .last_preview
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(at) = *last {
            if !cooldown.is_zero() && at.elapsed() < cooldown && target.exists() {
                return Ok(target);
            }
        }
        self.capture_into(&target)?;
        *last = Some(Instant::now());
        Ok(target)
    }

    fn capture_into(&self, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = temp_path_for(target);
        let result = match self.cfg.camera.source {
            CameraSource::Http => self.fetch_http(&tmp),
            CameraSource::Rtsp => self.fetch_rtsp(&tmp),
            CameraSource::WindowsHost => {
                return Err(LookoutError::CaptureUnavailable(
                    CameraSource::WindowsHost.as_str().to_string(),
                )
                .into());
            }
        };
        let result = result.and_then(|()| {
            fs::rename(&tmp, target).with_context(|| {
                format!("failed to move {} into {}", tmp.display(), target.display())
            })
        });
        if let Err(err) = &result {
            error!(
                source = self.cfg.camera.source.as_str(),
                error = %format!("{err:#}"),
                "capture failed"
            );
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn fetch_http(&self, tmp: &Path) -> Result<()> {
        let url = &self.cfg.camera.http_url;
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("camera http capture failed with status {}", response.status());
        }
        let bytes = response.bytes()?;
        fs::write(tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        Ok(())
    }

    fn ffmpeg_binary(&self) -> Result<PathBuf> {
        let configured = self.cfg.camera.ffmpeg_path.trim();
        if !configured.is_empty() {
            return Ok(PathBuf::from(configured));
        }
        which::which("ffmpeg").context("ffmpeg not found; set FFMPEG_PATH or install ffmpeg")
    }

    fn fetch_rtsp(&self, tmp: &Path) -> Result<()> {
        let ffmpeg = self.ffmpeg_binary()?;
        let mut cmd = Command::new(&ffmpeg);
        cmd.args(["-y", "-loglevel", "error", "-rtsp_transport", "tcp", "-i"])
            .arg(&self.cfg.camera.rtsp_url)
            .args(["-vframes", "1", "-q:v", "2", "-f", "image2", "-c:v", "mjpeg"])
            .arg(tmp);
        let output = run_command_with_optional_timeout(&mut cmd, Some(RTSP_CAPTURE_TIMEOUT_SECS))
            .with_context(|| format!("failed to run {}", ffmpeg.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
