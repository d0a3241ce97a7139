use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::snap::rate_limiter::LimiterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraSource {
    /// Frames are dropped into the snapshots dir by an external capture host.
    WindowsHost,
    Http,
    Rtsp,
}

impl CameraSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindowsHost => "windows-host",
            Self::Http => "http",
            Self::Rtsp => "rtsp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "windows-host" => Some(Self::WindowsHost),
            "http" => Some(Self::Http),
            "rtsp" => Some(Self::Rtsp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub source: CameraSource,
    pub http_url: String,
    pub rtsp_url: String,
    pub ffmpeg_path: String,
    pub capture_interval_min: u64,
    pub preview_cooldown_sec: u64,
    pub timezone: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::WindowsHost,
            http_url: String::new(),
            rtsp_url: String::new(),
            ffmpeg_path: String::new(),
            capture_interval_min: 10,
            preview_cooldown_sec: 5,
            timezone: "America/New_York".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub max_file_size_mb: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub dark_frame_check: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 10,
            min_width: 320,
            min_height: 240,
            max_width: 4096,
            max_height: 4096,
            dark_frame_check: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    pub enabled: bool,
    pub threshold: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: u64,
    pub min_snapshots: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 14,
            min_snapshots: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub retry_max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub request_timeout_secs: u64,
    pub tag_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_secs: 2,
            circuit_breaker_threshold: 5,
            request_timeout_secs: 60,
            tag_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub rate_limit_rpm: usize,
    pub cost_per_million_input: f64,
    pub cost_per_million_output: f64,
}

impl ProviderConfig {
    fn groq_default() -> Self {
        Self {
            api_key: String::new(),
            model: "meta-llama/llama-4-scout-17b-16e-instruct".to_string(),
            rate_limit_rpm: 30,
            cost_per_million_input: 0.0,
            cost_per_million_output: 0.0,
        }
    }

    fn gemini_default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.0-flash".to_string(),
            rate_limit_rpm: 15,
            cost_per_million_input: 0.0,
            cost_per_million_output: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub tagging_enabled: bool,
    pub stability_attempts: u32,
    pub stability_delay_ms: u64,
    pub scan_interval_secs: u64,
    pub metrics_interval_secs: u64,
    #[serde(default = "default_ask_lookback_hours")]
    pub ask_lookback_hours: u64,
    #[serde(default = "default_ask_max_items")]
    pub ask_max_items: usize,
}

fn default_ask_lookback_hours() -> u64 {
    24
}

fn default_ask_max_items() -> usize {
    40
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tagging_enabled: true,
            stability_attempts: 3,
            stability_delay_ms: 500,
            scan_interval_secs: 60,
            metrics_interval_secs: 60,
            ask_lookback_hours: default_ask_lookback_hours(),
            ask_max_items: default_ask_max_items(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookoutConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub camera: CameraConfig,
    pub images: ImageConfig,
    pub motion: MotionConfig,
    pub retention: RetentionConfig,
    pub api: ApiConfig,
    pub groq: ProviderConfig,
    pub gemini: ProviderConfig,
    pub pipeline: PipelineConfig,
}

impl Default for LookoutConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            log_level: "info".to_string(),
            camera: CameraConfig::default(),
            images: ImageConfig::default(),
            motion: MotionConfig::default(),
            retention: RetentionConfig::default(),
            api: ApiConfig::default(),
            groq: ProviderConfig::groq_default(),
            gemini: ProviderConfig::gemini_default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl LookoutConfig {
    /// Validated zone; `validate` guarantees the name parses.
    pub fn tz(&self) -> Tz {
        self.camera.timezone.parse().unwrap_or(Tz::UTC)
    }

    pub fn limiter_config(&self, rpm: usize) -> LimiterConfig {
        LimiterConfig {
            rpm,
            max_attempts: self.api.retry_max_attempts,
            base_delay_secs: self.api.retry_base_delay_secs,
            circuit_threshold: self.api.circuit_breaker_threshold,
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.images.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialProviderConfig {
    api_key: Option<String>,
    model: Option<String>,
    rate_limit_rpm: Option<usize>,
    cost_per_million_input: Option<f64>,
    cost_per_million_output: Option<f64>,
}

impl PartialProviderConfig {
    fn merge_into(self, base: &mut ProviderConfig) {
        if let Some(v) = self.api_key {
            base.api_key = v;
        }
        if let Some(v) = self.model {
            base.model = v;
        }
        if let Some(v) = self.rate_limit_rpm {
            base.rate_limit_rpm = v;
        }
        if let Some(v) = self.cost_per_million_input {
            base.cost_per_million_input = v;
        }
        if let Some(v) = self.cost_per_million_output {
            base.cost_per_million_output = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialLookoutConfig {
    data_dir: Option<PathBuf>,
    log_level: Option<String>,
    camera: Option<CameraConfig>,
    images: Option<ImageConfig>,
    motion: Option<MotionConfig>,
    retention: Option<RetentionConfig>,
    api: Option<ApiConfig>,
    groq: Option<PartialProviderConfig>,
    gemini: Option<PartialProviderConfig>,
    pipeline: Option<PipelineConfig>,
}

/// Environment lookup; tests pass a map instead of the process env.
pub struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvSource<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    fn raw(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, fallback: &str) -> String {
        self.raw(var).unwrap_or_else(|| fallback.to_string())
    }

    fn u64(&self, var: &str, fallback: u64) -> u64 {
        self.raw(var)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(fallback)
    }

    fn u32(&self, var: &str, fallback: u32) -> u32 {
        self.raw(var)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(fallback)
    }

    fn usize(&self, var: &str, fallback: usize) -> usize {
        self.raw(var)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(fallback)
    }

    fn f64(&self, var: &str, fallback: f64) -> f64 {
        self.raw(var)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(fallback)
    }

    fn bool(&self, var: &str, fallback: bool) -> bool {
        match self.raw(var) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => fallback,
            },
            None => fallback,
        }
    }
}

fn validate(cfg: &LookoutConfig) -> Result<(), ConfigError> {
    if cfg.camera.timezone.parse::<Tz>().is_err() {
        return Err(ConfigError::invalid(
            "timezone",
            format!("unknown zone `{}`", cfg.camera.timezone),
        ));
    }
    if cfg.camera.source == CameraSource::Http && cfg.camera.http_url.is_empty() {
        return Err(ConfigError::invalid(
            "camera http url",
            "CAMERA_HTTP_URL is required when CAMERA_SOURCE=http",
        ));
    }
    if cfg.camera.source == CameraSource::Rtsp && cfg.camera.rtsp_url.is_empty() {
        return Err(ConfigError::invalid(
            "camera rtsp url",
            "CAMERA_RTSP_URL is required when CAMERA_SOURCE=rtsp",
        ));
    }
    if cfg.camera.capture_interval_min == 0 {
        return Err(ConfigError::invalid("capture interval", "must be >= 1 minute"));
    }
    if cfg.retention.days == 0 {
        return Err(ConfigError::invalid("retention days", "must be >= 1"));
    }
    if !(0.0..=100.0).contains(&cfg.motion.threshold) {
        return Err(ConfigError::invalid(
            "motion threshold",
            "require 0 <= threshold <= 100",
        ));
    }
    if cfg.images.max_file_size_mb == 0 {
        return Err(ConfigError::invalid("max file size", "must be >= 1 MB"));
    }
    if cfg.images.min_width > cfg.images.max_width
        || cfg.images.min_height > cfg.images.max_height
    {
        return Err(ConfigError::invalid(
            "image dimensions",
            "minimum width/height must not exceed maximum",
        ));
    }
    if cfg.pipeline.scan_interval_secs == 0 || cfg.pipeline.metrics_interval_secs == 0 {
        return Err(ConfigError::invalid("pipeline intervals", "must be >= 1 second"));
    }
    if cfg.pipeline.ask_lookback_hours == 0 || cfg.pipeline.ask_max_items == 0 {
        return Err(ConfigError::invalid(
            "ask window",
            "lookback hours and max items must be >= 1",
        ));
    }
    if cfg.data_dir.as_os_str().is_empty() {
        return Err(ConfigError::invalid("data dir", "cannot be empty"));
    }
    Ok(())
}

fn resolve_config_path(env: &EnvSource<'_>) -> Option<PathBuf> {
    if let Some(custom) = env.raw("LOOKOUT_CONFIG_PATH") {
        return Some(PathBuf::from(custom));
    }
    Some(dirs::config_dir()?.join("lookout").join("lookout.toml"))
}

fn merge_file_config(base: &mut LookoutConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let parsed: PartialLookoutConfig = toml::from_str(&raw).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    if let Some(v) = parsed.data_dir {
        base.data_dir = v;
    }
    if let Some(v) = parsed.log_level {
        base.log_level = v;
    }
    if let Some(v) = parsed.camera {
        base.camera = v;
    }
    if let Some(v) = parsed.images {
        base.images = v;
    }
    if let Some(v) = parsed.motion {
        base.motion = v;
    }
    if let Some(v) = parsed.retention {
        base.retention = v;
    }
    if let Some(v) = parsed.api {
        base.api = v;
    }
    if let Some(v) = parsed.groq {
        v.merge_into(&mut base.groq);
    }
    if let Some(v) = parsed.gemini {
        v.merge_into(&mut base.gemini);
    }
    if let Some(v) = parsed.pipeline {
        base.pipeline = v;
    }
    Ok(())
}

fn apply_env(cfg: &mut LookoutConfig, env: &EnvSource<'_>) -> Result<(), ConfigError> {
    if let Some(dir) = env.raw("DATA_DIR") {
        cfg.data_dir = PathBuf::from(dir);
    }
    cfg.log_level = env.string("LOG_LEVEL", &cfg.log_level).to_ascii_lowercase();

    if let Some(raw) = env.raw("CAMERA_SOURCE") {
        cfg.camera.source = CameraSource::parse(&raw).ok_or_else(|| {
            ConfigError::invalid(
                "camera source",
                format!("`{raw}`; use windows-host, http or rtsp"),
            )
        })?;
    }
    cfg.camera.http_url = env.string("CAMERA_HTTP_URL", &cfg.camera.http_url);
    cfg.camera.rtsp_url = env.string("CAMERA_RTSP_URL", &cfg.camera.rtsp_url);
    cfg.camera.ffmpeg_path = env.string("FFMPEG_PATH", &cfg.camera.ffmpeg_path);
    cfg.camera.capture_interval_min =
        env.u64("CAPTURE_INTERVAL_MIN", cfg.camera.capture_interval_min);
    cfg.camera.preview_cooldown_sec =
        env.u64("PREVIEW_COOLDOWN_SEC", cfg.camera.preview_cooldown_sec);
    cfg.camera.timezone = env.string("TIMEZONE", &cfg.camera.timezone);

    cfg.images.max_file_size_mb = env.u64("MAX_FILE_SIZE_MB", cfg.images.max_file_size_mb);
    cfg.images.min_width = env.u32("IMAGE_MIN_WIDTH", cfg.images.min_width);
    cfg.images.min_height = env.u32("IMAGE_MIN_HEIGHT", cfg.images.min_height);
    cfg.images.max_width = env.u32("IMAGE_MAX_WIDTH", cfg.images.max_width);
    cfg.images.max_height = env.u32("IMAGE_MAX_HEIGHT", cfg.images.max_height);
    cfg.images.dark_frame_check = env.bool("DARK_FRAME_CHECK", cfg.images.dark_frame_check);

    cfg.motion.enabled = env.bool("MOTION_DETECTION_ENABLED", cfg.motion.enabled);
    cfg.motion.threshold = env.f64("MOTION_DETECTION_THRESHOLD", cfg.motion.threshold);

    cfg.retention.days = env.u64("RETENTION_DAYS", cfg.retention.days);
    cfg.retention.min_snapshots =
        env.usize("RETENTION_MIN_SNAPSHOTS", cfg.retention.min_snapshots);

    cfg.api.retry_max_attempts = env.u32("API_RETRY_MAX_ATTEMPTS", cfg.api.retry_max_attempts);
    cfg.api.retry_base_delay_secs =
        env.u64("API_RETRY_BASE_DELAY", cfg.api.retry_base_delay_secs);
    cfg.api.circuit_breaker_threshold = env.u32(
        "API_CIRCUIT_BREAKER_THRESHOLD",
        cfg.api.circuit_breaker_threshold,
    );
    cfg.api.request_timeout_secs =
        env.u64("API_REQUEST_TIMEOUT_SECS", cfg.api.request_timeout_secs);

    cfg.groq.api_key = env.string("GROQ_API_KEY", &cfg.groq.api_key);
    cfg.groq.model = env.string("GROQ_MODEL", &cfg.groq.model);
    cfg.groq.rate_limit_rpm = env.usize("GROQ_RATE_LIMIT_RPM", cfg.groq.rate_limit_rpm);
    cfg.groq.cost_per_million_input =
        env.f64("GROQ_COST_PER_MILLION_INPUT", cfg.groq.cost_per_million_input);
    cfg.groq.cost_per_million_output =
        env.f64("GROQ_COST_PER_MILLION_OUTPUT", cfg.groq.cost_per_million_output);

    cfg.gemini.api_key = env.string("GOOGLE_API_KEY", &cfg.gemini.api_key);
    cfg.gemini.model = env.string("GOOGLE_MODEL", &cfg.gemini.model);
    cfg.gemini.rate_limit_rpm = env.usize("GEMINI_RATE_LIMIT_RPM", cfg.gemini.rate_limit_rpm);
    cfg.gemini.cost_per_million_input =
        env.f64("GEMINI_COST_PER_MILLION_INPUT", cfg.gemini.cost_per_million_input);
    cfg.gemini.cost_per_million_output =
        env.f64("GEMINI_COST_PER_MILLION_OUTPUT", cfg.gemini.cost_per_million_output);

    cfg.pipeline.tagging_enabled = env.bool("TAGGING_ENABLED", cfg.pipeline.tagging_enabled);
    cfg.pipeline.stability_attempts =
        env.u32("STABILITY_ATTEMPTS", cfg.pipeline.stability_attempts);
    cfg.pipeline.stability_delay_ms =
        env.u64("STABILITY_DELAY_MS", cfg.pipeline.stability_delay_ms);
    cfg.pipeline.scan_interval_secs =
        env.u64("SCAN_INTERVAL_SECS", cfg.pipeline.scan_interval_secs);
    cfg.pipeline.ask_lookback_hours =
        env.u64("ASK_LOOKBACK_HOURS", cfg.pipeline.ask_lookback_hours);
    cfg.pipeline.ask_max_items = env.usize("ASK_MAX_ITEMS", cfg.pipeline.ask_max_items);
    Ok(())
}

pub fn load_config_with(env: &EnvSource<'_>) -> Result<LookoutConfig> {
    let mut cfg = LookoutConfig::default();
    if let Some(path) = resolve_config_path(env) {
        merge_file_config(&mut cfg, &path)?;
    }
    apply_env(&mut cfg, env)?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn load_config() -> Result<LookoutConfig> {
    let lookup = |var: &str| env::var(var).ok();
    load_config_with(&EnvSource::new(&lookup))
}
