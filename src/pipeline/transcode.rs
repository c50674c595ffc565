// Transcode engine: inspect with ffprobe, re-encode with ffmpeg when needed
//
// The ladder is walked high -> aggressive; the first profile whose output
// lands inside the accepted size bounds wins.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::{LadderStep, MediaEnvelope, ToolsConfig, TranscodeConfig};
use super::errors::{PipelineError, Result};
use super::models::DownloadedAsset;
use super::storage::RunWorkspace;
use super::tools::{ToolInvocation, ToolRunner};

/// Properties measured by ffprobe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaProperties {
    pub codec: Option<String>,
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    /// Seconds
    pub duration: Option<f64>,
    pub has_audio: bool,
}

impl MediaProperties {
    pub fn aspect_ratio(&self) -> Option<f64> {
        (self.width > 0 && self.height > 0).then(|| self.width as f64 / self.height as f64)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    pix_fmt: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse ffprobe rates like "30000/1001" or "25"
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn parse_seconds(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output
pub fn parse_ffprobe(json: &str) -> Result<MediaProperties> {
    let probe: ProbeOutput = serde_json::from_str(json)?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| PipelineError::transcode_failed("no video stream found"))?;

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate));

    let duration = parse_seconds(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .or_else(|| parse_seconds(video.duration.as_deref()));

    Ok(MediaProperties {
        codec: video.codec_name.clone(),
        pixel_format: video.pix_fmt.clone(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        duration,
        has_audio: probe
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio")),
    })
}

/// `floor(target_bytes * 8 / 1024 / duration)`
pub fn target_bitrate_kbps(target_bytes: u64, duration_secs: f64) -> u64 {
    if duration_secs <= 0.0 {
        return 0;
    }
    (target_bytes as f64 * 8.0 / 1024.0 / duration_secs).floor() as u64
}

/// Why the source cannot be passed through as-is
pub fn envelope_violations(
    envelope: &MediaEnvelope,
    props: &MediaProperties,
    size: u64,
    target_bytes: u64,
) -> Vec<String> {
    let mut out = Vec::new();

    let accepted = |value: &Option<String>, list: &[String]| {
        value
            .as_deref()
            .is_some_and(|v| list.iter().any(|a| a.eq_ignore_ascii_case(v)))
    };

    if !accepted(&props.codec, &envelope.accepted_codecs) {
        out.push(format!("codec {}", props.codec.as_deref().unwrap_or("unknown")));
    }
    if !accepted(&props.pixel_format, &envelope.accepted_pixel_formats) {
        out.push(format!(
            "pixel format {}",
            props.pixel_format.as_deref().unwrap_or("unknown")
        ));
    }
    if let Some(fps) = props.fps {
        if fps > envelope.max_fps + 0.01 {
            out.push(format!("{:.2} fps", fps));
        }
    }
    if let Some(aspect) = props.aspect_ratio() {
        if aspect < envelope.min_aspect_ratio - 1e-3 || aspect > envelope.max_aspect_ratio + 1e-3 {
            out.push(format!("aspect ratio {:.3}", aspect));
        }
    }
    if let Some(max_height) = envelope.max_height {
        if props.height > max_height {
            out.push(format!("height {}", props.height));
        }
    }
    if size > target_bytes {
        out.push(format!("size {} > {}", size, target_bytes));
    }
    out
}

/// Concrete encode settings for one ladder step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeProfile {
    pub name: String,
    pub codec: String,
    pub pixel_format: String,
    pub max_height: u32,
    pub max_fps: f64,
    pub video_bitrate_kbps: u64,
    pub audio_bitrate_kbps: u64,
    pub preset: String,
    pub min_output_bytes: u64,
    pub max_output_bytes: u64,
}

const MIN_VIDEO_KBPS: u64 = 100;

impl TranscodeProfile {
    pub fn from_step(step: &LadderStep, config: &TranscodeConfig, target_kbps: u64, target_bytes: u64) -> Self {
        let scaled = (target_kbps as f64 * step.bitrate_factor).floor() as u64;
        let video = scaled.saturating_sub(config.audio_bitrate_kbps).max(MIN_VIDEO_KBPS);
        let max_height = config
            .envelope
            .max_height
            .map_or(step.max_height, |h| h.min(step.max_height));

        Self {
            name: step.name.clone(),
            codec: "libx264".to_string(),
            pixel_format: config
                .envelope
                .accepted_pixel_formats
                .first()
                .cloned()
                .unwrap_or_else(|| "yuv420p".to_string()),
            max_height,
            max_fps: config.envelope.max_fps,
            video_bitrate_kbps: video,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            preset: step.preset.clone(),
            min_output_bytes: config.min_output_bytes,
            max_output_bytes: target_bytes,
        }
    }

    fn even(value: f64) -> u32 {
        let v = value.round() as u32;
        (v + (v & 1)).max(2)
    }

    /// Video filter chain: scale, pad into the aspect bounds, cap fps, pixel format
    pub fn video_filter(&self, props: &MediaProperties, envelope: &MediaEnvelope) -> String {
        let mut filters = Vec::new();

        if props.width > 0 && props.height > 0 {
            let height = Self::even(props.height.min(self.max_height) as f64);
            let width = Self::even(props.width as f64 * height as f64 / props.height as f64);
            filters.push(format!("scale={}:{}", width, height));

            let aspect = width as f64 / height as f64;
            if aspect > envelope.max_aspect_ratio {
                let padded = Self::even((width as f64 / envelope.max_aspect_ratio).ceil());
                filters.push(format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2", width, padded));
            } else if aspect < envelope.min_aspect_ratio {
                let padded = Self::even((height as f64 * envelope.min_aspect_ratio).ceil());
                filters.push(format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2", padded, height));
            }
        } else {
            filters.push(format!("scale=-2:'min({},ih)'", self.max_height));
        }

        if props.fps.is_some_and(|fps| fps > self.max_fps) {
            filters.push(format!("fps={}", self.max_fps));
        }
        filters.push(format!("format={}", self.pixel_format));
        filters.join(",")
    }

    /// Build ffmpeg arguments
    pub fn ffmpeg_args(&self, input: &Path, output: &Path, props: &MediaProperties, envelope: &MediaEnvelope) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-preset".into(),
            self.preset.clone(),
            "-b:v".into(),
            format!("{}k", self.video_bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", self.video_bitrate_kbps),
            "-bufsize".into(),
            format!("{}k", self.video_bitrate_kbps * 2),
            "-vf".into(),
            self.video_filter(props, envelope),
        ];

        if props.has_audio {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", self.audio_bitrate_kbps),
            ]);
        } else {
            args.push("-an".into());
        }

        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }
}

/// What the transcode stage hands to the uploader
#[derive(Debug)]
pub struct TranscodeOutcome {
    pub asset: DownloadedAsset,
    /// `None` for passthrough
    pub profile: Option<String>,
    pub properties: Option<MediaProperties>,
}

pub struct TranscodeEngine {
    runner: Arc<dyn ToolRunner>,
    config: TranscodeConfig,
    tools: ToolsConfig,
}

impl TranscodeEngine {
    pub fn new(runner: Arc<dyn ToolRunner>, config: TranscodeConfig, tools: ToolsConfig) -> Self {
        Self { runner, config, tools }
    }

    /// Run ffprobe on `path`
    pub async fn inspect(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaProperties> {
        let invocation = ToolInvocation::new(
            self.tools.ffprobe.clone(),
            vec![
                "-v".into(),
                "error".into(),
                "-print_format".into(),
                "json".into(),
                "-show_format".into(),
                "-show_streams".into(),
                path.to_string_lossy().to_string(),
            ],
            self.config.inspect_timeout,
        );

        let output = match self.runner.run(invocation, cancel).await {
            Ok(output) => output,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => return Err(PipelineError::transcode_failed(format!("inspection failed: {}", e))),
        };
        if !output.success() {
            return Err(PipelineError::transcode_failed(format!(
                "ffprobe exited with {:?}: {}",
                output.exit_code,
                output.stderr_tail(3)
            )));
        }
        parse_ffprobe(&output.stdout_lossy())
            .map_err(|e| PipelineError::transcode_failed(format!("unreadable ffprobe output: {}", e)))
    }

    /// Pass `asset` through or replace it with an encoded copy.
    ///
    /// The raw asset is dropped as soon as an encode succeeds, and on every
    /// error return.
    pub async fn prepare(
        &self,
        asset: DownloadedAsset,
        size_hint: Option<u64>,
        duration_hint: Option<f64>,
        workspace: &RunWorkspace,
        cancel: &CancellationToken,
    ) -> Result<TranscodeOutcome> {
        if !self.config.enabled {
            return Ok(TranscodeOutcome {
                asset,
                profile: None,
                properties: None,
            });
        }

        let target_bytes = size_hint.unwrap_or(self.config.target_size_bytes);
        let props = self.inspect(asset.path(), cancel).await?;
        let violations = envelope_violations(&self.config.envelope, &props, asset.size(), target_bytes);

        if violations.is_empty() {
            info!(size = asset.size(), "source fits the destination envelope, passing through");
            return Ok(TranscodeOutcome {
                asset,
                profile: None,
                properties: Some(props),
            });
        }
        info!(reasons = ?violations, "transcode required");

        let duration = props
            .duration
            .or(duration_hint.filter(|d| d.is_finite() && *d > 0.0))
            .ok_or_else(|| PipelineError::transcode_failed("duration unknown: not measurable and no hint given"))?;
        let target_kbps = target_bitrate_kbps(target_bytes, duration);

        for step in &self.config.ladder {
            let profile = TranscodeProfile::from_step(step, &self.config, target_kbps, target_bytes);
            let mut reservation = workspace.reserve(target_bytes)?;
            let output = workspace.temp_path(&format!("enc-{}-", profile.name), ".mp4")?;

            info!(
                profile = %profile.name,
                video_kbps = profile.video_bitrate_kbps,
                max_height = profile.max_height,
                "encoding"
            );
            let invocation = ToolInvocation::new(
                self.tools.ffmpeg.clone(),
                profile.ffmpeg_args(asset.path(), &output, &props, &self.config.envelope),
                self.config.encode_timeout,
            );

            match self.runner.run(invocation, cancel).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    warn!(profile = %profile.name, stderr = %out.stderr_tail(3), "encode failed");
                    continue;
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(PipelineError::ToolNotFound { tool }) => {
                    return Err(PipelineError::transcode_failed(format!("{} not found", tool)))
                }
                Err(e) => {
                    warn!(profile = %profile.name, error = %e, "encode failed");
                    continue;
                }
            }

            let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
            if size < profile.min_output_bytes || size > profile.max_output_bytes {
                warn!(
                    profile = %profile.name,
                    size,
                    min = profile.min_output_bytes,
                    max = profile.max_output_bytes,
                    "output outside accepted bounds"
                );
                continue;
            }

            reservation.settle(size)?;
            let encoded = DownloadedAsset::new(output, size, Some("video/mp4".to_string()), profile.name.clone(), reservation);
            asset.release()?;
            info!(profile = %profile.name, size, "✓ transcode complete");

            return Ok(TranscodeOutcome {
                asset: encoded,
                profile: Some(profile.name),
                properties: Some(props),
            });
        }

        Err(PipelineError::transcode_failed(format!(
            "no profile produced an output between {} and {} bytes",
            self.config.min_output_bytes, target_bytes
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::StorageConfig;
    use crate::pipeline::storage::DiskBudget;
    use crate::pipeline::tools::ToolOutput;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const H264_1080: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "pix_fmt": "yuv420p",
             "width": 1920, "height": 1080, "avg_frame_rate": "30000/1001", "r_frame_rate": "30000/1001"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "200.000000"}
    }"#;

    const HEVC_NO_DURATION: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "hevc", "pix_fmt": "yuv420p10le",
             "width": 3840, "height": 2160, "avg_frame_rate": "60/1"}
        ],
        "format": {}
    }"#;

    /// Answers ffprobe with canned JSON; ffmpeg writes the next queued size
    struct FakeTools {
        probe_json: String,
        encode_sizes: Mutex<VecDeque<u64>>,
        calls: Mutex<Vec<ToolInvocation>>,
    }

    impl FakeTools {
        fn new(probe_json: &str, encode_sizes: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                probe_json: probe_json.to_string(),
                encode_sizes: Mutex::new(encode_sizes.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolRunner for FakeTools {
        async fn run(&self, invocation: ToolInvocation, _cancel: &CancellationToken) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if invocation.tool_name == "ffprobe" {
                return Ok(ToolOutput {
                    exit_code: Some(0),
                    stdout: self.probe_json.as_bytes().to_vec(),
                    stderr: Vec::new(),
                });
            }
            let size = self.encode_sizes.lock().unwrap().pop_front().unwrap_or(0);
            let out = invocation.arguments.last().unwrap();
            std::fs::write(out, vec![0u8; size as usize]).unwrap();
            Ok(ToolOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn setup(root: &Path) -> (RunWorkspace, Arc<DiskBudget>) {
        let config = StorageConfig {
            work_dir: root.to_path_buf(),
            max_run_bytes: 64 << 20,
            max_total_bytes: 64 << 20,
        };
        let global = DiskBudget::new(config.max_total_bytes);
        (RunWorkspace::create(&config, &global, "transcode").unwrap(), global)
    }

    fn raw_asset(ws: &RunWorkspace, size: u64) -> DownloadedAsset {
        let path = ws.temp_path("src-", ".bin").unwrap();
        std::fs::write(&path, vec![1u8; size as usize]).unwrap();
        let reservation = ws.reserve(size).unwrap();
        DownloadedAsset::new(path, size, Some("video/mp4".into()), "direct-http", reservation)
    }

    fn config() -> TranscodeConfig {
        TranscodeConfig {
            min_output_bytes: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_bitrate_for_90mb_over_200s() {
        assert_eq!(target_bitrate_kbps(90 * 1024 * 1024, 200.0), 3686);
        assert_eq!(target_bitrate_kbps(1000, 0.0), 0);
    }

    #[test]
    fn test_parse_frame_rate() {
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[test]
    fn test_parse_ffprobe() {
        let props = parse_ffprobe(H264_1080).unwrap();
        assert_eq!(props.codec.as_deref(), Some("h264"));
        assert_eq!((props.width, props.height), (1920, 1080));
        assert_eq!(props.duration, Some(200.0));
        assert!(props.has_audio);
        assert!(parse_ffprobe(r#"{"streams": []}"#).is_err());
    }

    #[test]
    fn test_envelope_violations() {
        let envelope = MediaEnvelope::default();
        let ok = parse_ffprobe(H264_1080).unwrap();
        assert!(envelope_violations(&envelope, &ok, 10, 100).is_empty());
        assert_eq!(envelope_violations(&envelope, &ok, 200, 100).len(), 1);

        let hevc = parse_ffprobe(HEVC_NO_DURATION).unwrap();
        let reasons = envelope_violations(&envelope, &hevc, 10, 100);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_profile_bitrates_follow_ladder() {
        let config = TranscodeConfig::default();
        let kbps = target_bitrate_kbps(90 * 1024 * 1024, 200.0);
        let high = TranscodeProfile::from_step(&config.ladder[0], &config, kbps, 1);
        let aggressive = TranscodeProfile::from_step(&config.ladder[2], &config, kbps, 1);
        assert_eq!(high.video_bitrate_kbps, (3686.0f64 * 0.95).floor() as u64 - 128);
        assert!(aggressive.video_bitrate_kbps < high.video_bitrate_kbps);
        assert_eq!(aggressive.max_height, 480);
    }

    #[test]
    fn test_filter_pads_wide_sources() {
        let config = TranscodeConfig::default();
        let profile = TranscodeProfile::from_step(&config.ladder[1], &config, 2000, 1);
        let props = MediaProperties {
            width: 2560,
            height: 1080,
            fps: Some(120.0),
            ..Default::default()
        };
        let filter = profile.video_filter(&props, &config.envelope);
        assert!(filter.starts_with("scale=1708:720,pad=1708:962"));
        assert!(filter.contains("fps=60"));
        assert!(filter.ends_with("format=yuv420p"));
    }

    #[tokio::test]
    async fn test_passthrough_keeps_asset() {
        let root = tempfile::tempdir().unwrap();
        let (ws, _g) = setup(root.path());
        let tools = FakeTools::new(H264_1080, &[]);
        let engine = TranscodeEngine::new(tools.clone(), config(), ToolsConfig::default());

        let raw = raw_asset(&ws, 5000);
        let raw_path = raw.path_buf();
        let out = engine
            .prepare(raw, None, None, &ws, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.profile.is_none());
        assert_eq!(out.asset.path(), raw_path.as_path());
        assert_eq!(tools.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_walks_ladder_and_releases_raw() {
        let root = tempfile::tempdir().unwrap();
        let (ws, global) = setup(root.path());
        // first profile overshoots the 20_000 byte target, second fits
        let tools = FakeTools::new(H264_1080, &[25_000, 12_000]);
        let engine = TranscodeEngine::new(tools.clone(), config(), ToolsConfig::default());

        let raw = raw_asset(&ws, 50_000);
        let raw_path = raw.path_buf();
        let out = engine
            .prepare(raw, Some(20_000), None, &ws, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.profile.as_deref(), Some("standard"));
        assert_eq!(out.asset.size(), 12_000);
        assert!(!raw_path.exists());
        assert_eq!(global.used(), 12_000);
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 1);

        let calls = tools.calls.lock().unwrap();
        let encode = &calls[2].arguments;
        assert!(encode.iter().any(|a| a == "-b:v"));
        assert!(!encode.iter().any(|a| a == "-an"));
    }

    #[tokio::test]
    async fn test_missing_duration_fails() {
        let root = tempfile::tempdir().unwrap();
        let (ws, global) = setup(root.path());
        let tools = FakeTools::new(HEVC_NO_DURATION, &[]);
        let engine = TranscodeEngine::new(tools, config(), ToolsConfig::default());

        let err = engine
            .prepare(raw_asset(&ws, 5000), None, None, &ws, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::pipeline::errors::ErrorKind::TranscodeFailed);
        assert_eq!(global.used(), 0);
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_ladder_exhaustion_fails() {
        let root = tempfile::tempdir().unwrap();
        let (ws, _g) = setup(root.path());
        let tools = FakeTools::new(HEVC_NO_DURATION, &[500, 500, 500]);
        let engine = TranscodeEngine::new(tools, config(), ToolsConfig::default());

        let err = engine
            .prepare(raw_asset(&ws, 5000), None, Some(30.0), &ws, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TranscodeFailed { .. }));
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }
}
