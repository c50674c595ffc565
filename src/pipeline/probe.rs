// Probe executor: cheap ranged fetch per candidate
//
// Classifies each candidate before the real transfer so obviously dead links
// and login walls are rejected without downloading gigabytes of HTML.

use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::ProbeConfig;
use super::diagnostics::{diagnose_page, diagnose_status, SourceBlockReason};
use super::errors::{PipelineError, Result};
use super::models::{AcquisitionAttempt, AttemptOutcome, Candidate, StrategyKind};

lazy_static::lazy_static! {
    static ref DOWNLOAD_FORM: Regex =
        Regex::new(r#"(?is)(<form[^>]*id\s*=\s*["']download-form["'][^>]*>)(.*?)</form>"#).unwrap();
    static ref FORM_ACTION: Regex = Regex::new(r#"(?i)action\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref HIDDEN_INPUT: Regex =
        Regex::new(r#"(?i)<input[^>]*type\s*=\s*["']hidden["'][^>]*>"#).unwrap();
    static ref INPUT_NAME: Regex = Regex::new(r#"(?i)name\s*=\s*["']([^"']*)["']"#).unwrap();
    static ref INPUT_VALUE: Regex = Regex::new(r#"(?i)value\s*=\s*["']([^"']*)["']"#).unwrap();
}

/// Result of probing one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    /// Looks like the real file
    ReachableVideo {
        content_type: Option<String>,
        total_size: Option<u64>,
    },
    /// Interstitial confirmation page; `url` skips it
    ConfirmationRequired { url: String },
    /// Login or permission wall
    AuthWallSuspected {
        reason: SourceBlockReason,
        content_type: Option<String>,
        observed_size: Option<u64>,
    },
    Unreachable {
        status: Option<u16>,
        reason: Option<SourceBlockReason>,
        detail: String,
    },
    /// Tool-based candidate, not probed
    Deferred,
}

/// What the probe saw, independent of how it was fetched
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub total_size: Option<u64>,
}

/// Candidates that survived probing, plus attempts for the rejected ones
#[derive(Debug, Default)]
pub struct ProbeTriage {
    pub usable: Vec<Candidate>,
    pub attempts: Vec<AcquisitionAttempt>,
}

/// Total size from `Content-Range: bytes 0-1023/12345`
pub fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Media type without parameters, lowercased
pub fn normalize_content_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct == "text/html" || ct == "application/xhtml+xml")
}

/// Content types that plausibly carry a video file
pub fn is_video_like(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            ct.starts_with("video/")
                || ct.starts_with("audio/")
                || ct.starts_with("binary/")
                || matches!(
                    ct,
                    "application/octet-stream"
                        | "application/mp4"
                        | "application/x-matroska"
                        | "application/force-download"
                        | "application/x-download"
                )
        }
    }
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Build the confirmed download URL from a Drive `download-form` page
pub fn parse_confirm_form(body: &str, base: &str) -> Option<String> {
    let caps = DOWNLOAD_FORM.captures(body)?;
    let form_tag = caps.get(1)?.as_str();
    let inner = caps.get(2)?.as_str();

    let action = decode_entities(FORM_ACTION.captures(form_tag)?.get(1)?.as_str());
    let mut url = match Url::parse(&action) {
        Ok(url) => url,
        Err(_) => Url::parse(base).ok()?.join(&action).ok()?,
    };

    let fields: Vec<(String, String)> = HIDDEN_INPUT
        .find_iter(inner)
        .filter_map(|m| {
            let tag = m.as_str();
            let name = INPUT_NAME.captures(tag)?.get(1)?.as_str().to_string();
            let value = INPUT_VALUE
                .captures(tag)
                .and_then(|c| c.get(1))
                .map(|v| decode_entities(v.as_str()))
                .unwrap_or_default();
            Some((name, value))
        })
        .filter(|(name, _)| !name.is_empty())
        .collect();

    if !fields.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Some(url.to_string())
}

/// Ranged-request prober
#[derive(Debug, Clone)]
pub struct ProbeExecutor {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl ProbeExecutor {
    pub fn new(client: reqwest::Client, config: ProbeConfig) -> Self {
        Self { client, config }
    }

    fn is_login_redirect(&self, final_url: &str) -> bool {
        let Ok(url) = Url::parse(final_url) else {
            return false;
        };
        let location = format!(
            "{}{}",
            url.host_str().unwrap_or_default().to_ascii_lowercase(),
            url.path()
        );
        self.config
            .login_domains
            .iter()
            .any(|d| location.starts_with(d.as_str()))
    }

    /// Decide a verdict from response metadata and, for HTML, the inspected body
    pub fn classify(&self, meta: &ResponseMeta, body: Option<&str>) -> ProbeVerdict {
        let content_type = meta.content_type.clone();

        if self.is_login_redirect(&meta.final_url) {
            return ProbeVerdict::AuthWallSuspected {
                reason: SourceBlockReason::LoginRequired,
                content_type,
                observed_size: meta.total_size,
            };
        }

        let status = StatusCode::from_u16(meta.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !status.is_success() {
            let page_reason = body.and_then(diagnose_page);
            let status_reason = diagnose_status(meta.status);
            return match (meta.status, page_reason.or(status_reason)) {
                (401 | 403, reason) => ProbeVerdict::AuthWallSuspected {
                    reason: reason.unwrap_or(SourceBlockReason::PermissionDenied),
                    content_type,
                    observed_size: meta.total_size,
                },
                (_, reason) => ProbeVerdict::Unreachable {
                    status: Some(meta.status),
                    reason,
                    detail: format!("HTTP {}", meta.status),
                },
            };
        }

        if is_html(content_type.as_deref()) {
            if let Some(body) = body {
                if let Some(url) = parse_confirm_form(body, &meta.final_url) {
                    return ProbeVerdict::ConfirmationRequired { url };
                }
            }
            let size = meta.total_size.or(body.map(|b| b.len() as u64));
            let looks_small = size.map_or(true, |s| s <= self.config.html_small_body_bytes);
            if looks_small {
                let reason = body.and_then(diagnose_page);
                if reason == Some(SourceBlockReason::NotFound) {
                    return ProbeVerdict::Unreachable {
                        status: Some(meta.status),
                        reason,
                        detail: "not-found page".to_string(),
                    };
                }
                return ProbeVerdict::AuthWallSuspected {
                    reason: reason.unwrap_or(SourceBlockReason::Unknown),
                    content_type,
                    observed_size: size,
                };
            }
            return ProbeVerdict::ReachableVideo {
                content_type,
                total_size: meta.total_size,
            };
        }

        let big_enough = meta
            .total_size
            .is_some_and(|s| s >= self.config.min_video_like_bytes);
        if is_video_like(content_type.as_deref()) || big_enough {
            return ProbeVerdict::ReachableVideo {
                content_type,
                total_size: meta.total_size,
            };
        }

        ProbeVerdict::Unreachable {
            status: Some(meta.status),
            reason: None,
            detail: format!(
                "unexpected {} body of {} bytes",
                content_type.as_deref().unwrap_or("untyped"),
                meta.total_size.map_or_else(|| "unknown".to_string(), |s| s.to_string())
            ),
        }
    }

    async fn fetch(&self, url: &str) -> std::result::Result<(ResponseMeta, Option<String>), reqwest::Error> {
        let last = self.config.range_bytes.saturating_sub(1);
        let mut response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes=0-{}", last))
            .timeout(self.config.timeout)
            .send()
            .await?;

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_content_type)
            .filter(|ct| !ct.is_empty());
        let total_size = match response.status() {
            StatusCode::PARTIAL_CONTENT => headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range),
            _ => headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        };

        let meta = ResponseMeta {
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
            content_type,
            total_size,
        };

        let wants_body = is_html(meta.content_type.as_deref()) || !response.status().is_success();
        let body = if wants_body {
            let mut buf: Vec<u8> = Vec::new();
            while buf.len() < self.config.max_inspect_bytes {
                match response.chunk().await? {
                    Some(chunk) => buf.extend_from_slice(&chunk),
                    None => break,
                }
            }
            buf.truncate(self.config.max_inspect_bytes);
            Some(String::from_utf8_lossy(&buf).to_string())
        } else {
            None
        };

        Ok((meta, body))
    }

    /// Probe a single candidate
    pub async fn probe(&self, candidate: &Candidate, cancel: &CancellationToken) -> Result<ProbeVerdict> {
        if candidate.kind == StrategyKind::ExtractorTool {
            return Ok(ProbeVerdict::Deferred);
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            fetched = self.fetch(&candidate.url) => fetched,
        };

        let verdict = match fetched {
            Ok((meta, body)) => self.classify(&meta, body.as_deref()),
            Err(e) => ProbeVerdict::Unreachable {
                status: e.status().map(|s| s.as_u16()),
                reason: (e.is_timeout() || e.is_connect()).then_some(SourceBlockReason::NetworkTimeout),
                detail: e.to_string(),
            },
        };

        debug!(strategy = %candidate.strategy_id, url = %candidate.url, ?verdict, "probe verdict");
        Ok(verdict)
    }

    /// Probe every candidate in order and split them into usable and rejected.
    ///
    /// Reachable and deferred candidates keep their order. Suspected auth walls
    /// are dropped (or moved to the back when skipping is disabled).
    pub async fn triage(&self, candidates: Vec<Candidate>, cancel: &CancellationToken) -> Result<ProbeTriage> {
        let mut triage = ProbeTriage::default();
        let mut walled: Vec<Candidate> = Vec::new();

        for candidate in candidates {
            match self.probe(&candidate, cancel).await? {
                ProbeVerdict::ReachableVideo { .. } | ProbeVerdict::Deferred => triage.usable.push(candidate),
                ProbeVerdict::ConfirmationRequired { url } => {
                    info!(strategy = %candidate.strategy_id, "following download confirmation form");
                    triage.usable.push(Candidate { url, ..candidate });
                }
                ProbeVerdict::AuthWallSuspected {
                    reason,
                    content_type,
                    observed_size,
                } => {
                    if self.config.skip_suspected_auth_walls {
                        info!(strategy = %candidate.strategy_id, ?reason, "skipping suspected auth wall");
                        triage.attempts.push(
                            AcquisitionAttempt::new(&candidate, AttemptOutcome::AuthRequired)
                                .with_size(observed_size)
                                .with_content_type(content_type)
                                .with_block_reason(Some(reason))
                                .with_detail(reason.description()),
                        );
                    } else {
                        walled.push(candidate);
                    }
                }
                ProbeVerdict::Unreachable { status, reason, detail } => {
                    info!(strategy = %candidate.strategy_id, ?status, %detail, "candidate unreachable");
                    triage.attempts.push(
                        AcquisitionAttempt::new(&candidate, AttemptOutcome::Unreachable)
                            .with_block_reason(reason)
                            .with_detail(detail),
                    );
                }
            }
        }

        triage.usable.extend(walled);
        Ok(triage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ProbeExecutor {
        ProbeExecutor::new(reqwest::Client::new(), ProbeConfig::default())
    }

    fn meta(status: u16, content_type: Option<&str>, total_size: Option<u64>) -> ResponseMeta {
        ResponseMeta {
            status,
            final_url: "https://files.example.com/v.mp4".to_string(),
            content_type: content_type.map(|s| s.to_string()),
            total_size,
        }
    }

    const CONFIRM_PAGE: &str = r#"<html><body>
        <p>Google Drive can't scan this file for viruses.</p>
        <form id="download-form" action="https://drive.usercontent.google.com/download" method="get">
          <input type="submit" id="uc-download-link" value="Download anyway"/>
          <input type="hidden" name="id" value="FILEID123">
          <input type="hidden" name="export" value="download">
          <input type="hidden" name="confirm" value="t">
          <input type="hidden" name="uuid" value="0f1e2d3c-aaaa-bbbb">
        </form></body></html>"#;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-1023/734003200"), Some(734_003_200));
        assert_eq!(parse_content_range("bytes 0-1023/*"), None);
    }

    #[test]
    fn test_confirm_form_url() {
        let url = parse_confirm_form(CONFIRM_PAGE, "https://drive.google.com/uc").unwrap();
        assert_eq!(
            url,
            "https://drive.usercontent.google.com/download?id=FILEID123&export=download&confirm=t&uuid=0f1e2d3c-aaaa-bbbb"
        );
    }

    #[test]
    fn test_confirm_form_relative_action() {
        let page = r#"<form id="download-form" action="/download"><input type="hidden" name="id" value="X"></form>"#;
        let url = parse_confirm_form(page, "http://127.0.0.1:9000/uc?id=X").unwrap();
        assert_eq!(url, "http://127.0.0.1:9000/download?id=X");
    }

    #[test]
    fn test_confirmation_page_verdict() {
        let verdict = executor().classify(&meta(200, Some("text/html"), None), Some(CONFIRM_PAGE));
        assert!(matches!(verdict, ProbeVerdict::ConfirmationRequired { .. }));
    }

    #[test]
    fn test_small_html_is_auth_wall() {
        let body = "<html>You need access</html>";
        let verdict = executor().classify(&meta(200, Some("text/html"), Some(2048)), Some(body));
        assert_eq!(
            verdict,
            ProbeVerdict::AuthWallSuspected {
                reason: SourceBlockReason::PermissionDenied,
                content_type: Some("text/html".to_string()),
                observed_size: Some(2048),
            }
        );
    }

    #[test]
    fn test_login_redirect_is_auth_wall() {
        let mut m = meta(200, Some("text/html"), Some(50_000));
        m.final_url = "https://accounts.google.com/ServiceLogin?continue=x".to_string();
        let verdict = executor().classify(&m, None);
        assert!(matches!(
            verdict,
            ProbeVerdict::AuthWallSuspected {
                reason: SourceBlockReason::LoginRequired,
                ..
            }
        ));
    }

    #[test]
    fn test_status_verdicts() {
        let ex = executor();
        assert!(matches!(
            ex.classify(&meta(403, Some("text/html"), None), None),
            ProbeVerdict::AuthWallSuspected { .. }
        ));
        assert!(matches!(
            ex.classify(&meta(404, None, None), None),
            ProbeVerdict::Unreachable { status: Some(404), .. }
        ));
        assert!(matches!(
            ex.classify(&meta(503, None, None), None),
            ProbeVerdict::Unreachable { status: Some(503), .. }
        ));
    }

    #[test]
    fn test_video_types_and_big_bodies_pass() {
        let ex = executor();
        assert!(matches!(
            ex.classify(&meta(206, Some("video/mp4"), Some(10)), None),
            ProbeVerdict::ReachableVideo { .. }
        ));
        assert!(matches!(
            ex.classify(&meta(200, Some("text/plain"), Some(50_000_000)), None),
            ProbeVerdict::ReachableVideo { .. }
        ));
        assert!(matches!(
            ex.classify(&meta(200, Some("application/json"), Some(300)), None),
            ProbeVerdict::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn test_tool_candidates_are_deferred() {
        let candidate = Candidate {
            index: 0,
            strategy_id: "yt-dlp".to_string(),
            kind: StrategyKind::ExtractorTool,
            url: "https://youtu.be/x".to_string(),
        };
        let verdict = executor().probe(&candidate, &CancellationToken::new()).await.unwrap();
        assert_eq!(verdict, ProbeVerdict::Deferred);
    }
}
