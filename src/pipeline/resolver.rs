// Source resolver: reference string -> canonical id + ordered candidates
//
// Pure and deterministic; no network access happens here.

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::config::ResolverConfig;
use super::errors::{PipelineError, Result};
use super::models::{Candidate, MediaSourceReference, ProviderKind, StrategyKind};

lazy_static::lazy_static! {
    static ref BARE_DRIVE_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{25,}$").unwrap();
    static ref DRIVE_PATH_ID: Regex = Regex::new(r"/d/([A-Za-z0-9_-]{10,})").unwrap();
    static ref DROPBOX_SHARE_PATH: Regex = Regex::new(r"^/(s|scl/fi)/").unwrap();
    static ref DEFAULT_CONFIG: ResolverConfig = ResolverConfig::default();
}

const DRIVE_HOSTS: &[&str] = &[
    "drive.google.com",
    "docs.google.com",
    "drive.usercontent.google.com",
];

/// Strategy id of the extraction-tool candidate
pub const EXTRACTOR_STRATEGY: &str = "yt-dlp";

/// Strategy id of a plain HTTP candidate
pub const DIRECT_STRATEGY: &str = "direct-http";

/// Canonical id plus the ordered ways of fetching it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub canonical_id: String,
    pub provider: ProviderKind,
    pub candidates: Vec<Candidate>,
}

/// Provider kind of a raw reference, using the default video-host list
pub fn infer_provider(raw: &str) -> ProviderKind {
    classify(raw.trim(), &DEFAULT_CONFIG.video_host_domains)
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

fn parse_http(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
}

fn classify(raw: &str, video_hosts: &[String]) -> ProviderKind {
    if BARE_DRIVE_ID.is_match(raw) {
        return ProviderKind::GoogleDrive;
    }

    let Some(url) = parse_http(raw) else {
        return ProviderKind::Unknown;
    };
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

    if DRIVE_HOSTS.iter().any(|d| host == *d) {
        return ProviderKind::GoogleDrive;
    }
    if host_matches(&host, "dropbox.com") && DROPBOX_SHARE_PATH.is_match(url.path()) {
        return ProviderKind::Dropbox;
    }
    if video_hosts.iter().any(|d| host_matches(&host, d)) {
        return ProviderKind::VideoHost;
    }
    ProviderKind::GenericHttp
}

/// Extract the file id from a Drive link or bare id
pub fn drive_file_id(raw: &str) -> Option<String> {
    if BARE_DRIVE_ID.is_match(raw) {
        return Some(raw.to_string());
    }
    let url = parse_http(raw)?;

    if let Some(caps) = DRIVE_PATH_ID.captures(url.path()) {
        return Some(caps[1].to_string());
    }
    url.query_pairs()
        .find(|(k, v)| k == "id" && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// Turns references into candidate lists
#[derive(Debug, Clone, Default)]
pub struct SourceResolver {
    config: ResolverConfig,
}

impl SourceResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, reference: &MediaSourceReference) -> Result<ResolvedSource> {
        let raw = reference.raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::invalid_reference(raw, "empty reference"));
        }

        let provider = classify(raw, &self.config.video_host_domains);
        let (canonical_id, candidates) = match provider {
            ProviderKind::GoogleDrive => self.resolve_drive(raw)?,
            ProviderKind::Dropbox => self.resolve_dropbox(raw)?,
            ProviderKind::VideoHost => self.resolve_video_host(raw)?,
            ProviderKind::GenericHttp => self.resolve_http(raw)?,
            ProviderKind::Unknown => {
                return Err(PipelineError::invalid_reference(
                    raw,
                    "not an http(s) URL or a known share link",
                ))
            }
        };

        if candidates.is_empty() {
            return Err(PipelineError::invalid_reference(raw, "no download strategy configured"));
        }

        Ok(ResolvedSource {
            canonical_id,
            provider,
            candidates,
        })
    }

    fn resolve_drive(&self, raw: &str) -> Result<(String, Vec<Candidate>)> {
        let id = drive_file_id(raw)
            .ok_or_else(|| PipelineError::invalid_reference(raw, "no file id in Drive link"))?;

        let candidates = self
            .config
            .drive_templates
            .iter()
            .enumerate()
            .map(|(index, template)| Candidate {
                index,
                strategy_id: template.name.clone(),
                kind: StrategyKind::HttpStream,
                url: template.render(&id),
            })
            .collect();

        Ok((format!("gdrive:{}", id), candidates))
    }

    fn resolve_dropbox(&self, raw: &str) -> Result<(String, Vec<Candidate>)> {
        let url = parse_http(raw)
            .ok_or_else(|| PipelineError::invalid_reference(raw, "malformed Dropbox link"))?;

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "dl")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut direct = url.clone();
        direct.set_fragment(None);
        direct
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .append_pair("dl", "1");

        let mut usercontent = url.clone();
        usercontent.set_fragment(None);
        usercontent
            .set_host(Some("dl.dropboxusercontent.com"))
            .map_err(|e| PipelineError::invalid_reference(raw, e.to_string()))?;
        if kept.is_empty() {
            usercontent.set_query(None);
        } else {
            usercontent
                .query_pairs_mut()
                .clear()
                .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let candidates = vec![
            Candidate {
                index: 0,
                strategy_id: "dropbox-dl".to_string(),
                kind: StrategyKind::HttpStream,
                url: direct.to_string(),
            },
            Candidate {
                index: 1,
                strategy_id: "dropbox-usercontent".to_string(),
                kind: StrategyKind::HttpStream,
                url: usercontent.to_string(),
            },
        ];

        Ok((format!("dropbox:{}", url.path()), candidates))
    }

    fn resolve_video_host(&self, raw: &str) -> Result<(String, Vec<Candidate>)> {
        let mut url = parse_http(raw)
            .ok_or_else(|| PipelineError::invalid_reference(raw, "malformed video URL"))?;
        url.set_fragment(None);

        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches("www.")
            .to_ascii_lowercase();
        let mut canonical = format!("video:{}{}", host, url.path().trim_end_matches('/'));
        if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
            canonical.push_str("?v=");
            canonical.push_str(&v);
        }

        let candidates = vec![Candidate {
            index: 0,
            strategy_id: EXTRACTOR_STRATEGY.to_string(),
            kind: StrategyKind::ExtractorTool,
            url: url.to_string(),
        }];
        Ok((canonical, candidates))
    }

    fn resolve_http(&self, raw: &str) -> Result<(String, Vec<Candidate>)> {
        let mut url = parse_http(raw)
            .ok_or_else(|| PipelineError::invalid_reference(raw, "malformed URL"))?;
        url.set_fragment(None);

        let candidates = vec![Candidate {
            index: 0,
            strategy_id: DIRECT_STRATEGY.to_string(),
            kind: StrategyKind::HttpStream,
            url: url.to_string(),
        }];
        Ok((format!("http:{}", url), candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::errors::ErrorKind;

    const ID: &str = "1AbCdEfGhIjKlMnOpQrStUvWxYz_-0123";

    fn resolve(raw: &str) -> Result<ResolvedSource> {
        SourceResolver::default().resolve(&MediaSourceReference::new(raw))
    }

    #[test]
    fn test_drive_link_shapes() {
        let shapes = [
            format!("https://drive.google.com/file/d/{}/view?usp=sharing", ID),
            format!("https://drive.google.com/open?id={}", ID),
            format!("https://drive.google.com/uc?id={}&export=download", ID),
            format!("https://docs.google.com/file/d/{}/edit", ID),
            ID.to_string(),
        ];
        for raw in shapes {
            let resolved = resolve(&raw).unwrap();
            assert_eq!(resolved.provider, ProviderKind::GoogleDrive, "{}", raw);
            assert_eq!(resolved.canonical_id, format!("gdrive:{}", ID));
            assert_eq!(resolved.candidates.len(), 3);
            assert_eq!(resolved.candidates[0].strategy_id, "drive-usercontent");
            assert!(resolved.candidates.iter().all(|c| c.url.contains(ID)));
        }
    }

    #[test]
    fn test_drive_link_without_id_is_invalid() {
        let err = resolve("https://drive.google.com/drive/my-drive").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidReference);
    }

    #[test]
    fn test_dropbox_candidates() {
        let resolved = resolve("https://www.dropbox.com/scl/fi/abc123/clip.mp4?rlkey=xyz&dl=0").unwrap();
        assert_eq!(resolved.provider, ProviderKind::Dropbox);
        assert_eq!(resolved.candidates.len(), 2);
        assert_eq!(
            resolved.candidates[0].url,
            "https://www.dropbox.com/scl/fi/abc123/clip.mp4?rlkey=xyz&dl=1"
        );
        assert_eq!(
            resolved.candidates[1].url,
            "https://dl.dropboxusercontent.com/scl/fi/abc123/clip.mp4?rlkey=xyz"
        );
        assert_eq!(resolved.canonical_id, "dropbox:/scl/fi/abc123/clip.mp4");
    }

    #[test]
    fn test_video_host_uses_extractor() {
        let resolved = resolve("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10").unwrap();
        assert_eq!(resolved.provider, ProviderKind::VideoHost);
        assert_eq!(resolved.canonical_id, "video:youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(resolved.candidates[0].kind, StrategyKind::ExtractorTool);
        assert_eq!(resolved.candidates[0].strategy_id, EXTRACTOR_STRATEGY);
    }

    #[test]
    fn test_generic_http() {
        let resolved = resolve("https://cdn.example.com/media/clip.mp4#t=5").unwrap();
        assert_eq!(resolved.provider, ProviderKind::GenericHttp);
        assert_eq!(resolved.candidates.len(), 1);
        assert_eq!(resolved.candidates[0].url, "https://cdn.example.com/media/clip.mp4");
        assert_eq!(resolved.canonical_id, "http:https://cdn.example.com/media/clip.mp4");
    }

    #[test]
    fn test_invalid_references() {
        for raw in ["", "   ", "ftp://example.com/a.mp4", "not a url", "short_id"] {
            let err = resolve(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidReference, "{}", raw);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let raw = format!("https://drive.google.com/file/d/{}/view", ID);
        assert_eq!(resolve(&raw).unwrap(), resolve(&raw).unwrap());
    }

    #[test]
    fn test_custom_templates_in_order() {
        let config = ResolverConfig::default().with_drive_templates(vec![
            crate::pipeline::config::UrlTemplate::new("a", "http://127.0.0.1:1/a/{id}"),
            crate::pipeline::config::UrlTemplate::new("b", "http://127.0.0.1:1/b/{id}"),
        ]);
        let resolved = SourceResolver::new(config)
            .resolve(&MediaSourceReference::new(ID))
            .unwrap();
        let urls: Vec<&str> = resolved.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                format!("http://127.0.0.1:1/a/{}", ID),
                format!("http://127.0.0.1:1/b/{}", ID)
            ]
        );
        assert_eq!(resolved.candidates[1].index, 1);
    }
}
