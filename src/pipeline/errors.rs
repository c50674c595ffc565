// Error types for the relay pipeline

use serde::{Deserialize, Serialize};

use super::diagnostics::{remediation_for_attempts, SourceBlockReason};
use super::models::{AcquisitionAttempt, AttemptOutcome};

/// Result type alias using the pipeline error
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Flat error taxonomy reported to callers in `PublishResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidReference,
    SourceUnreachable,
    SourceAuthRequired,
    SourceIncomplete,
    TranscodeFailed,
    UploadSessionRejected,
    ChunkTransferFailed,
    UploadFinishRejected,
    VerificationInconclusive,
    DiskExhausted,
    Cancelled,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No provider pattern matched the reference
    #[error("invalid source reference `{input}`: {reason}")]
    InvalidReference { input: String, reason: String },

    /// Every candidate was dead, timed out or returned garbage
    #[error("source unreachable after {} attempt(s)", attempts.len())]
    SourceUnreachable { attempts: Vec<AcquisitionAttempt> },

    /// Every usable candidate answered with a login or permission wall
    #[error("source requires authentication after {} attempt(s)", attempts.len())]
    SourceAuthRequired { attempts: Vec<AcquisitionAttempt> },

    /// Transfers started but never produced a complete file
    #[error("source transfer incomplete after {} attempt(s)", attempts.len())]
    SourceIncomplete { attempts: Vec<AcquisitionAttempt> },

    #[error("transcode failed: {reason}")]
    TranscodeFailed { reason: String },

    /// `start` (or a direct upload) was refused by the destination
    #[error("upload session rejected{}: {message}", status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    UploadSessionRejected { status: Option<u16>, message: String },

    #[error("chunk at offset {offset} failed after {attempts} attempt(s): {message}")]
    ChunkTransferFailed {
        offset: u64,
        attempts: u32,
        message: String,
    },

    #[error("upload finish rejected: {message}")]
    UploadFinishRejected { message: String },

    #[error("publish could not be verified after {polls} poll(s)")]
    VerificationInconclusive { polls: u32 },

    #[error("disk budget exhausted: needed {requested} bytes, {available} available")]
    DiskExhausted { requested: u64, available: u64 },

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn invalid_reference(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn transcode_failed(reason: impl Into<String>) -> Self {
        Self::TranscodeFailed {
            reason: reason.into(),
        }
    }

    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Pick the most specific acquisition error for an exhausted candidate list.
    ///
    /// Auth walls win over incomplete transfers, which win over plain
    /// unreachability: the most actionable cause is the one reported.
    pub fn acquisition_failed(attempts: Vec<AcquisitionAttempt>) -> Self {
        let any = |o: AttemptOutcome| attempts.iter().any(|a| a.outcome == o);

        if any(AttemptOutcome::AuthRequired) || attempts.iter().any(|a| a.auth_wall_suspected) {
            Self::SourceAuthRequired { attempts }
        } else if any(AttemptOutcome::Incomplete) || any(AttemptOutcome::Stagnant) {
            Self::SourceIncomplete { attempts }
        } else {
            Self::SourceUnreachable { attempts }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference { .. } => ErrorKind::InvalidReference,
            Self::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            Self::SourceAuthRequired { .. } => ErrorKind::SourceAuthRequired,
            Self::SourceIncomplete { .. } => ErrorKind::SourceIncomplete,
            Self::TranscodeFailed { .. } => ErrorKind::TranscodeFailed,
            Self::UploadSessionRejected { .. } => ErrorKind::UploadSessionRejected,
            Self::ChunkTransferFailed { .. } => ErrorKind::ChunkTransferFailed,
            Self::UploadFinishRejected { .. } => ErrorKind::UploadFinishRejected,
            Self::VerificationInconclusive { .. } => ErrorKind::VerificationInconclusive,
            Self::DiskExhausted { .. } => ErrorKind::DiskExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ToolNotFound { .. }
            | Self::ToolTimeout { .. }
            | Self::ToolFailed { .. }
            | Self::Network(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_) => ErrorKind::Internal,
        }
    }

    /// Attempt trail carried by acquisition errors
    pub fn attempts(&self) -> &[AcquisitionAttempt] {
        match self {
            Self::SourceUnreachable { attempts }
            | Self::SourceAuthRequired { attempts }
            | Self::SourceIncomplete { attempts } => attempts,
            _ => &[],
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            Self::ToolTimeout { .. } | Self::ChunkTransferFailed { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Remediation hint shown next to the failure
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::InvalidReference { .. } => Some(
                "Use a public HTTP(S) link, a Google Drive or Dropbox share link, \
                 or a supported video-site URL"
                    .to_string(),
            ),
            Self::SourceUnreachable { attempts }
            | Self::SourceAuthRequired { attempts }
            | Self::SourceIncomplete { attempts } => Some(remediation_for_attempts(attempts)),
            Self::TranscodeFailed { .. } => Some(
                "Check that ffmpeg/ffprobe are installed, or raise the target size \
                 so a lower-quality profile can fit"
                    .to_string(),
            ),
            Self::UploadSessionRejected { .. } => Some(
                "The destination refused the upload: check that the access token is valid \
                 for this page and that the file is within the page's size limit"
                    .to_string(),
            ),
            Self::ChunkTransferFailed { .. } => Some(
                "A chunk kept failing: check the network path to the destination \
                 and try again (a new session will be started)"
                    .to_string(),
            ),
            Self::UploadFinishRejected { .. } => Some(
                "The destination rejected the post metadata: shorten the title, \
                 description or tags and retry"
                    .to_string(),
            ),
            Self::VerificationInconclusive { .. } => Some(
                "The upload finished but the post was not seen yet; check the page manually"
                    .to_string(),
            ),
            Self::DiskExhausted { .. } => Some(
                "Free space in the work directory or raise the storage budget".to_string(),
            ),
            Self::ToolNotFound { tool } => Some(format!("Install {} or set its path in the config", tool)),
            _ => None,
        }
    }

    /// Block reason of the most informative attempt, if any
    pub fn block_reason(&self) -> Option<SourceBlockReason> {
        self.attempts().iter().rev().find_map(|a| a.block_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{Candidate, StrategyKind};

    fn attempt(outcome: AttemptOutcome) -> AcquisitionAttempt {
        let candidate = Candidate {
            index: 0,
            strategy_id: "direct-http".to_string(),
            kind: StrategyKind::HttpStream,
            url: "https://example.com/v.mp4".to_string(),
        };
        AcquisitionAttempt::new(&candidate, outcome)
    }

    #[test]
    fn test_auth_wall_is_most_specific() {
        let err = PipelineError::acquisition_failed(vec![
            attempt(AttemptOutcome::Unreachable),
            attempt(AttemptOutcome::AuthRequired),
            attempt(AttemptOutcome::Stagnant),
        ]);
        assert_eq!(err.kind(), ErrorKind::SourceAuthRequired);
        assert_eq!(err.attempts().len(), 3);
    }

    #[test]
    fn test_stagnant_maps_to_incomplete() {
        let err = PipelineError::acquisition_failed(vec![
            attempt(AttemptOutcome::Unreachable),
            attempt(AttemptOutcome::Stagnant),
        ]);
        assert_eq!(err.kind(), ErrorKind::SourceIncomplete);
    }

    #[test]
    fn test_unreachable_fallback() {
        let err = PipelineError::acquisition_failed(vec![attempt(AttemptOutcome::Failed)]);
        assert_eq!(err.kind(), ErrorKind::SourceUnreachable);
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        let err = PipelineError::UploadSessionRejected {
            status: Some(400),
            message: "bad token".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("HTTP 400"));
        assert!(!PipelineError::invalid_reference("x", "no match").is_retryable());
    }
}
