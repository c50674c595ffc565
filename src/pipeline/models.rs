// Common data models for the relay pipeline

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use time::OffsetDateTime;

use super::diagnostics::SourceBlockReason;
use super::errors::ErrorKind;
use super::storage::DiskReservation;

/// Shape of the host a source reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Plain HTTP(S) host that can be range-probed
    GenericHttp,
    /// Google Drive share link or bare file id
    GoogleDrive,
    /// Dropbox share link
    Dropbox,
    /// Video-hosting site that needs an extraction tool
    VideoHost,
    /// Nothing matched (rejected by the resolver)
    Unknown,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenericHttp => write!(f, "http"),
            Self::GoogleDrive => write!(f, "google-drive"),
            Self::Dropbox => write!(f, "dropbox"),
            Self::VideoHost => write!(f, "video-host"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Immutable description of where the video comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSourceReference {
    pub raw: String,
    pub provider: ProviderKind,
    /// Expected size of the complete file, when the caller knows it
    pub size_hint: Option<u64>,
    /// Expected duration in seconds, when the caller knows it
    pub duration_hint: Option<f64>,
}

impl MediaSourceReference {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let provider = super::resolver::infer_provider(&raw);
        Self {
            raw,
            provider,
            size_hint: None,
            duration_hint: None,
        }
    }

    pub fn with_size_hint(mut self, bytes: Option<u64>) -> Self {
        self.size_hint = bytes;
        self
    }

    pub fn with_duration_hint(mut self, seconds: Option<f64>) -> Self {
        self.duration_hint = seconds;
        self
    }
}

/// How a candidate is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Native streaming HTTP GET
    HttpStream,
    /// External extraction tool (yt-dlp) writing to a local path
    ExtractorTool,
}

/// One concrete way of retrieving the source bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Position in the resolver's ordered list
    pub index: usize,
    /// Stable strategy id (e.g. "drive-usercontent", "direct-http", "yt-dlp")
    pub strategy_id: String,
    pub kind: StrategyKind,
    pub url: String,
}

/// Outcome of probing or attempting a single candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Failed,
    Unreachable,
    Stagnant,
    AuthRequired,
    Incomplete,
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Append-only audit record for one probed or attempted candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionAttempt {
    pub candidate_index: usize,
    pub strategy_id: String,
    pub url: String,
    pub outcome: AttemptOutcome,
    pub observed_size: Option<u64>,
    pub content_type: Option<String>,
    pub auth_wall_suspected: bool,
    pub block_reason: Option<SourceBlockReason>,
    pub detail: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl AcquisitionAttempt {
    pub fn new(candidate: &Candidate, outcome: AttemptOutcome) -> Self {
        Self {
            candidate_index: candidate.index,
            strategy_id: candidate.strategy_id.clone(),
            url: candidate.url.clone(),
            outcome,
            observed_size: None,
            content_type: None,
            auth_wall_suspected: matches!(outcome, AttemptOutcome::AuthRequired),
            block_reason: None,
            detail: None,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.observed_size = size;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_block_reason(mut self, reason: Option<SourceBlockReason>) -> Self {
        if reason.is_some_and(|r| r.is_auth_related()) {
            self.auth_wall_suspected = true;
        }
        self.block_reason = reason;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Local file owned by one pipeline run.
///
/// The file is deleted when the asset is dropped, and the disk-budget
/// reservation it holds is returned at the same time. Stages hand the asset
/// downstream by value so that an upstream artifact disappears as soon as
/// the next stage no longer needs it.
#[derive(Debug)]
pub struct DownloadedAsset {
    path: TempPath,
    size: u64,
    content_type: Option<String>,
    produced_by: String,
    _reservation: DiskReservation,
}

impl DownloadedAsset {
    pub(crate) fn new(
        path: TempPath,
        size: u64,
        content_type: Option<String>,
        produced_by: impl Into<String>,
        reservation: DiskReservation,
    ) -> Self {
        Self {
            path,
            size,
            content_type,
            produced_by: produced_by.into(),
            _reservation: reservation,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Strategy id or transcode profile name that produced the file
    pub fn produced_by(&self) -> &str {
        &self.produced_by
    }

    /// Delete the file now instead of waiting for the drop.
    pub fn release(self) -> std::io::Result<()> {
        let Self { path, .. } = self;
        path.close()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

/// Post visibility on the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    /// Viewable by anyone with the link, kept out of the feed and search
    Unlisted,
    Private,
}

impl Visibility {
    /// Graph-style privacy value; unlisted videos are public but `secret`
    pub fn privacy_value(&self) -> &'static str {
        match self {
            Self::Public | Self::Unlisted => "EVERYONE",
            Self::Private => "SELF",
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Unlisted)
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Descriptive metadata sent with `finish`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    /// Text the verifier looks for; falls back to the title
    pub marker: Option<String>,
}

impl PostMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_marker(mut self, marker: Option<String>) -> Self {
        self.marker = marker;
        self
    }

    pub fn verification_marker(&self) -> &str {
        self.marker
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.title)
    }

    /// Trimmed, de-duplicated, length-capped tags, at most `max_tags` of them
    pub fn normalized_tags(&self, max_tags: usize, max_len: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for tag in &self.tags {
            let tag: String = tag.trim().trim_start_matches('#').chars().take(max_len).collect();
            if tag.is_empty() || out.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                continue;
            }
            out.push(tag);
            if out.len() == max_tags {
                break;
            }
        }
        out
    }
}

/// Destination page/container and the bearer credential for it
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationTarget {
    pub container_id: String,
    pub access_token: String,
}

impl DestinationTarget {
    pub fn new(container_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for DestinationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationTarget")
            .field("container_id", &self.container_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Everything one pipeline run needs from its caller
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub source: MediaSourceReference,
    pub destination: DestinationTarget,
    pub metadata: PostMetadata,
}

/// Destination-side confirmation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    ConfirmedVideo,
    Unconfirmed,
    /// Stored as a link card instead of inline media
    Fallback,
    /// Verification disabled or never reached
    Skipped,
}

/// Pipeline stages, in the only order they may be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Resolving,
    Probing,
    Acquiring,
    Transcoding,
    Uploading,
    Verifying,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Probing => "probing",
            Self::Acquiring => "acquiring",
            Self::Transcoding => "transcoding",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// One structured entry of the run's diagnostics list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: PipelineStage,
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn info(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(stage: PipelineStage, kind: ErrorKind, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            stage,
            kind: Some(kind),
            message: message.into(),
            hint,
        }
    }
}

/// Terminal record returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub run_id: String,
    pub asset_id: Option<String>,
    pub verification: VerificationStatus,
    pub verified: bool,
    pub size_bytes: Option<u64>,
    pub strategy_used: Option<String>,
    pub profile_used: Option<String>,
    pub error: Option<ErrorKind>,
    pub hint: Option<String>,
    pub attempts: Vec<AcquisitionAttempt>,
    pub diagnostics: Vec<Diagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_normalized_and_capped() {
        let meta = PostMetadata::new("t").with_tags(vec![
            " #travel ".to_string(),
            "Travel".to_string(),
            "".to_string(),
            "a-very-long-tag-that-goes-on".to_string(),
            "food".to_string(),
            "extra".to_string(),
        ]);
        let tags = meta.normalized_tags(3, 10);
        assert_eq!(tags, vec!["travel", "a-very-lon", "food"]);
    }

    #[test]
    fn test_marker_falls_back_to_title() {
        let meta = PostMetadata::new("Sunset timelapse");
        assert_eq!(meta.verification_marker(), "Sunset timelapse");
        let meta = meta.with_marker(Some("#run-42".to_string()));
        assert_eq!(meta.verification_marker(), "#run-42");
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let target = DestinationTarget::new("123", "EAAB-secret");
        let printed = format!("{:?}", target);
        assert!(printed.contains("123"));
        assert!(!printed.contains("EAAB-secret"));
    }

    #[test]
    fn test_stage_order_is_forward() {
        assert!(PipelineStage::Resolving < PipelineStage::Probing);
        assert!(PipelineStage::Transcoding < PipelineStage::Uploading);
        assert!(PipelineStage::Verifying < PipelineStage::Done);
    }
}
