// Source diagnostics - identifies why a host refused to hand over the file
//
// Analyzes response bodies and tool stderr to determine:
// - Type of block (login wall, permission, quota, ...)
// - Recommended action for the user
// - Whether another strategy might still work

use serde::{Deserialize, Serialize};

use super::models::{AcquisitionAttempt, AttemptOutcome};

/// Reasons why a source host might refuse a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceBlockReason {
    /// Redirected to a sign-in page
    LoginRequired,

    /// File exists but is not shared with "anyone with the link"
    PermissionDenied,

    /// Drive download quota for the file was exceeded
    QuotaExceeded,

    /// Drive "can't scan this file for viruses" interstitial
    VirusScanWarning,

    /// File deleted or link mistyped
    NotFound,

    /// 429 or similar throttling
    RateLimited,

    /// Video-site private video
    PrivateVideo,

    /// Video-site age gate
    AgeRestricted,

    /// Geographic restriction
    GeoBlocked,

    /// Captcha / unusual traffic page
    BotDetection,

    /// Connection timeout or refusal
    NetworkTimeout,

    Unknown,
}

impl SourceBlockReason {
    /// Whether the reason means credentials or sharing settings are the problem
    pub fn is_auth_related(&self) -> bool {
        matches!(
            self,
            Self::LoginRequired | Self::PermissionDenied | Self::PrivateVideo | Self::AgeRestricted
        )
    }

    /// Whether retrying later (same settings) might help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::RateLimited | Self::NetworkTimeout | Self::BotDetection
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::LoginRequired => "Host redirected to a sign-in page",
            Self::PermissionDenied => "File is not shared publicly",
            Self::QuotaExceeded => "Download quota exceeded for this file",
            Self::VirusScanWarning => "Large-file virus scan confirmation page",
            Self::NotFound => "File not found",
            Self::RateLimited => "Rate limited by the host",
            Self::PrivateVideo => "Private video",
            Self::AgeRestricted => "Age-restricted video",
            Self::GeoBlocked => "Geographic restriction",
            Self::BotDetection => "Bot detection triggered",
            Self::NetworkTimeout => "Network timeout",
            Self::Unknown => "Unknown block reason",
        }
    }

    /// What the user can do about it
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::LoginRequired | Self::PermissionDenied => {
                "source access restricted — set sharing to 'Anyone with the link' (viewer)"
            }
            Self::QuotaExceeded => {
                "download quota exceeded — wait 24h or copy the file to another drive and share the copy"
            }
            Self::VirusScanWarning => {
                "large-file confirmation page could not be bypassed — share a direct download link instead"
            }
            Self::NotFound => "file not found — check that the link is correct and the file was not deleted",
            Self::RateLimited => "the host is throttling requests — wait a few minutes and retry",
            Self::PrivateVideo => "the video is private — make it public or unlisted",
            Self::AgeRestricted => "the video is age-restricted — upload the file to a drive instead",
            Self::GeoBlocked => "the video is geo-blocked — configure a proxy in an allowed region",
            Self::BotDetection => "the host suspects automation — retry later or configure a proxy",
            Self::NetworkTimeout => "network timeout — check connectivity or configure a proxy",
            Self::Unknown => "check that the link opens in a private browser window",
        }
    }
}

/// Classify an HTML page returned instead of the file
pub fn diagnose_page(body: &str) -> Option<SourceBlockReason> {
    let lower = body.to_lowercase();

    if lower.contains("download-form")
        || lower.contains("can't scan this file for viruses")
        || lower.contains("virus scan warning")
    {
        return Some(SourceBlockReason::VirusScanWarning);
    }

    if lower.contains("quota exceeded")
        || lower.contains("too many users have viewed or downloaded")
    {
        return Some(SourceBlockReason::QuotaExceeded);
    }

    if lower.contains("you need access")
        || lower.contains("request access")
        || lower.contains("you need permission")
        || lower.contains("access denied")
    {
        return Some(SourceBlockReason::PermissionDenied);
    }

    if lower.contains("servicelogin")
        || lower.contains("accounts.google.com")
        || lower.contains("sign in")
        || lower.contains("log in to")
    {
        return Some(SourceBlockReason::LoginRequired);
    }

    if lower.contains("unusual traffic") || lower.contains("captcha") {
        return Some(SourceBlockReason::BotDetection);
    }

    if lower.contains("404") && lower.contains("not found") {
        return Some(SourceBlockReason::NotFound);
    }

    None
}

/// Classify an HTTP status that refused the request
pub fn diagnose_status(status: u16) -> Option<SourceBlockReason> {
    match status {
        401 => Some(SourceBlockReason::LoginRequired),
        403 => Some(SourceBlockReason::PermissionDenied),
        404 | 410 => Some(SourceBlockReason::NotFound),
        429 => Some(SourceBlockReason::RateLimited),
        _ => None,
    }
}

/// Analyze extraction-tool stderr and return the block reason
pub fn diagnose_tool_error(error: &str) -> Option<SourceBlockReason> {
    let lower = error.to_lowercase();

    if lower.contains("private video") || lower.contains("video is private") {
        return Some(SourceBlockReason::PrivateVideo);
    }

    if lower.contains("age-restricted")
        || lower.contains("sign in to confirm your age")
        || lower.contains("age_verification")
    {
        return Some(SourceBlockReason::AgeRestricted);
    }

    if lower.contains("not available in your country") || lower.contains("blocked in your country") {
        return Some(SourceBlockReason::GeoBlocked);
    }

    if lower.contains("sign in") || lower.contains("login required") || lower.contains("cookies") {
        return Some(SourceBlockReason::LoginRequired);
    }

    if lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("404")
    {
        return Some(SourceBlockReason::NotFound);
    }

    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
        return Some(SourceBlockReason::RateLimited);
    }

    if lower.contains("bot") || lower.contains("captcha") {
        return Some(SourceBlockReason::BotDetection);
    }

    if lower.contains("403") || lower.contains("forbidden") {
        return Some(SourceBlockReason::PermissionDenied);
    }

    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("connection refused") {
        return Some(SourceBlockReason::NetworkTimeout);
    }

    if !error.trim().is_empty() {
        return Some(SourceBlockReason::Unknown);
    }

    None
}

/// Build a remediation hint from an exhausted attempt trail.
///
/// The first concrete block reason wins; otherwise the hint is derived from
/// the dominant outcome.
pub fn remediation_for_attempts(attempts: &[AcquisitionAttempt]) -> String {
    if let Some(reason) = attempts
        .iter()
        .filter_map(|a| a.block_reason)
        .find(|r| *r != SourceBlockReason::Unknown)
    {
        return reason.remediation().to_string();
    }

    if attempts.iter().any(|a| a.auth_wall_suspected) {
        return SourceBlockReason::PermissionDenied.remediation().to_string();
    }

    let count = |o: AttemptOutcome| attempts.iter().filter(|a| a.outcome == o).count();

    if count(AttemptOutcome::Stagnant) + count(AttemptOutcome::TimedOut) > 0 {
        return "transfers stalled — the host is throttling or the file is very large; \
                retry later or provide a direct link"
            .to_string();
    }

    if count(AttemptOutcome::Incomplete) > 0 {
        let largest = attempts.iter().filter_map(|a| a.observed_size).max().unwrap_or(0);
        return format!(
            "only {} bytes could be retrieved — the file may be truncated or not shared publicly",
            largest
        );
    }

    if attempts.is_empty() {
        return "no acquisition strategy was available for this source".to_string();
    }

    "source could not be reached — check the link and that the host is online".to_string()
}
