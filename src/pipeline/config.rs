// Pipeline configuration
//
// Every section has sensible defaults; a JSON file may override any subset of
// fields and a handful of environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{PipelineError, Result};

/// (De)serialize a `Duration` as fractional seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration `{}` seconds: {}", secs, e))
        })
    }
}

/// Network configuration shared by every HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// SOCKS5/HTTP proxy URL (e.g., "socks5h://127.0.0.1:1080")
    pub proxy: Option<String>,

    /// Connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Build the reqwest client used by every stage
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy_url) = self.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| PipelineError::Config(format!("invalid proxy `{}`: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        Ok(builder.build()?)
    }
}

/// Named URL template with an `{id}` placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTemplate {
    pub name: String,
    pub template: String,
}

impl UrlTemplate {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
        }
    }

    pub fn render(&self, id: &str) -> String {
        self.template.replace("{id}", id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Ordered Drive download templates, tried first to last
    pub drive_templates: Vec<UrlTemplate>,

    /// Domains handed to the extraction tool
    pub video_host_domains: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            drive_templates: vec![
                UrlTemplate::new(
                    "drive-usercontent",
                    "https://drive.usercontent.google.com/download?id={id}&export=download&confirm=t",
                ),
                UrlTemplate::new(
                    "drive-uc-confirm",
                    "https://drive.google.com/uc?export=download&id={id}&confirm=t",
                ),
                UrlTemplate::new("drive-uc", "https://drive.google.com/uc?export=download&id={id}"),
            ],
            video_host_domains: [
                "youtube.com",
                "youtu.be",
                "vimeo.com",
                "dailymotion.com",
                "tiktok.com",
                "instagram.com",
                "twitter.com",
                "x.com",
                "facebook.com",
                "fb.watch",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        }
    }
}

impl ResolverConfig {
    pub fn with_drive_templates(mut self, templates: Vec<UrlTemplate>) -> Self {
        self.drive_templates = templates;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Bytes requested by the ranged probe
    pub range_bytes: u64,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// HTML bodies up to this size are treated as a suspected auth wall
    pub html_small_body_bytes: u64,

    /// Bodies at least this large count as video whatever their type says
    pub min_video_like_bytes: u64,

    /// How much of an HTML body is read to look for confirmation forms
    pub max_inspect_bytes: usize,

    /// Redirect targets that mean "sign in first"
    pub login_domains: Vec<String>,

    /// Drop suspected auth walls instead of trying them last
    pub skip_suspected_auth_walls: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            range_bytes: 1024,
            timeout: Duration::from_secs(15),
            html_small_body_bytes: 1_000_000,
            min_video_like_bytes: 1_000_000,
            max_inspect_bytes: 256 * 1024,
            login_domains: vec![
                "accounts.google.com".to_string(),
                "login.live.com".to_string(),
                "login.microsoftonline.com".to_string(),
                "www.dropbox.com/login".to_string(),
            ],
            skip_suspected_auth_walls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// How often received-byte growth is checked
    #[serde(with = "duration_secs")]
    pub stagnation_interval: Duration,

    /// Growth below this between two checks counts as a stalled check
    pub stagnation_min_delta_bytes: u64,

    /// Consecutive stalled checks before the attempt is abandoned
    pub stagnation_max_checks: u32,

    /// Hard limit for a single attempt
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,

    /// Smallest file accepted as a real video
    pub absolute_floor_bytes: u64,

    /// Fraction of the size hint a download must reach
    pub size_hint_tolerance: f64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            stagnation_interval: Duration::from_secs(30),
            stagnation_min_delta_bytes: 64 * 1024,
            stagnation_max_checks: 3,
            attempt_timeout: Duration::from_secs(30 * 60),
            absolute_floor_bytes: 1_000_000,
            size_hint_tolerance: 0.95,
        }
    }
}

impl DownloadConfig {
    /// Minimum acceptable size: `max(floor, hint * tolerance)`
    pub fn size_floor(&self, size_hint: Option<u64>) -> u64 {
        match size_hint {
            Some(hint) => {
                let scaled = (hint as f64 * self.size_hint_tolerance).floor() as u64;
                scaled.max(self.absolute_floor_bytes)
            }
            None => self.absolute_floor_bytes,
        }
    }
}

/// One rung of the quality ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    pub name: String,
    /// Output height cap
    pub max_height: u32,
    /// Share of the size-derived bitrate this step may use
    pub bitrate_factor: f64,
    /// x264 preset
    pub preset: String,
}

impl LadderStep {
    pub fn new(name: &str, max_height: u32, bitrate_factor: f64, preset: &str) -> Self {
        Self {
            name: name.to_string(),
            max_height,
            bitrate_factor,
            preset: preset.to_string(),
        }
    }
}

/// What the destination accepts without re-encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaEnvelope {
    pub accepted_codecs: Vec<String>,
    pub accepted_pixel_formats: Vec<String>,
    pub max_fps: f64,
    /// width / height
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub max_height: Option<u32>,
}

impl Default for MediaEnvelope {
    fn default() -> Self {
        Self {
            accepted_codecs: vec!["h264".to_string()],
            accepted_pixel_formats: vec!["yuv420p".to_string()],
            max_fps: 60.0,
            min_aspect_ratio: 9.0 / 16.0,
            max_aspect_ratio: 16.0 / 9.0,
            max_height: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub enabled: bool,
    pub envelope: MediaEnvelope,

    /// Output size target when the request carries no size hint
    pub target_size_bytes: u64,

    pub audio_bitrate_kbps: u64,

    /// Smallest encode output accepted
    pub min_output_bytes: u64,

    /// Ordered high → aggressive
    pub ladder: Vec<LadderStep>,

    #[serde(with = "duration_secs")]
    pub inspect_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub encode_timeout: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            envelope: MediaEnvelope::default(),
            target_size_bytes: 1024 * 1024 * 1024,
            audio_bitrate_kbps: 128,
            min_output_bytes: 100 * 1024,
            ladder: vec![
                LadderStep::new("high", 1080, 0.95, "slow"),
                LadderStep::new("standard", 720, 0.80, "medium"),
                LadderStep::new("aggressive", 480, 0.60, "veryfast"),
            ],
            inspect_timeout: Duration::from_secs(60),
            encode_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Video upload endpoint base (graph-video host)
    pub graph_video_url: String,

    /// Files below this go through a single request
    pub direct_threshold_bytes: u64,

    pub chunk_size_bytes: u64,
    pub max_concurrent_chunks: usize,

    /// Retries per chunk, not counting the first try
    pub max_chunk_retries: u32,

    #[serde(with = "duration_secs")]
    pub chunk_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,

    #[serde(with = "duration_secs")]
    pub retry_max_delay: Duration,

    /// Timeout for start/finish and for the whole direct upload
    #[serde(with = "duration_secs")]
    pub phase_timeout: Duration,

    pub max_tags: usize,
    pub max_tag_len: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            graph_video_url: "https://graph-video.facebook.com/v19.0".to_string(),
            direct_threshold_bytes: 100 * 1024 * 1024,
            chunk_size_bytes: 4 * 1024 * 1024,
            max_concurrent_chunks: 3,
            max_chunk_retries: 3,
            chunk_timeout: Duration::from_secs(120),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            phase_timeout: Duration::from_secs(10 * 60),
            max_tags: 10,
            max_tag_len: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub enabled: bool,

    /// Graph API base for reads (listing, credential check)
    pub graph_url: String,

    pub max_polls: u32,

    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Timeout of one listing request (and of the credential check)
    #[serde(with = "duration_secs")]
    pub poll_timeout: Duration,

    /// Posts older than this are ignored
    #[serde(with = "duration_secs")]
    pub recency_window: Duration,

    pub listing_limit: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graph_url: "https://graph.facebook.com/v19.0".to_string(),
            max_polls: 6,
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(20),
            recency_window: Duration::from_secs(30 * 60),
            listing_limit: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Parent of every run workspace
    pub work_dir: PathBuf,

    /// Scratch bytes a single run may hold at once
    pub max_run_bytes: u64,

    /// Scratch bytes all concurrent runs may hold together
    pub max_total_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let work_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("post-relay");
        Self {
            work_dir,
            max_run_bytes: 8 * 1024 * 1024 * 1024,
            max_total_bytes: 32 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffprobe: String,
    pub ffmpeg: String,
    pub ytdlp: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe: "ffprobe".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ytdlp: "yt-dlp".to_string(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub network: NetworkConfig,
    pub resolver: ResolverConfig,
    pub probe: ProbeConfig,
    pub download: DownloadConfig,
    pub transcode: TranscodeConfig,
    pub upload: UploadConfig,
    pub verify: VerifyConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

impl PipelineConfig {
    /// Load from a JSON file, falling back to defaults for missing fields
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else defaults, then apply environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(dir) = var("POST_RELAY_WORK_DIR") {
            self.storage.work_dir = PathBuf::from(dir);
        }
        if let Some(proxy) = var("POST_RELAY_PROXY") {
            self.network.proxy = Some(proxy);
        }
        if let Some(url) = var("POST_RELAY_GRAPH_VIDEO_URL") {
            self.upload.graph_video_url = url;
        }
        if let Some(url) = var("POST_RELAY_GRAPH_URL") {
            self.verify.graph_url = url;
        }
        if let Some(path) = var("POST_RELAY_FFMPEG") {
            self.tools.ffmpeg = path;
        }
        if let Some(path) = var("POST_RELAY_FFPROBE") {
            self.tools.ffprobe = path;
        }
        if let Some(path) = var("POST_RELAY_YTDLP") {
            self.tools.ytdlp = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size_bytes == 0 {
            return Err(PipelineError::Config("upload.chunk_size_bytes must be > 0".to_string()));
        }
        if self.upload.max_concurrent_chunks == 0 {
            return Err(PipelineError::Config(
                "upload.max_concurrent_chunks must be > 0".to_string(),
            ));
        }
        if self.download.stagnation_interval.is_zero() || self.download.stagnation_max_checks == 0 {
            return Err(PipelineError::Config(
                "download stagnation interval and check count must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.download.size_hint_tolerance) {
            return Err(PipelineError::Config(
                "download.size_hint_tolerance must be within 0..=1".to_string(),
            ));
        }
        if self.transcode.enabled && self.transcode.ladder.is_empty() {
            return Err(PipelineError::Config("transcode.ladder must not be empty".to_string()));
        }
        if self.storage.max_run_bytes > self.storage.max_total_bytes {
            return Err(PipelineError::Config(
                "storage.max_run_bytes cannot exceed storage.max_total_bytes".to_string(),
            ));
        }
        Ok(())
    }
}
