// Publish verifier: poll the container feed until the post shows up
//
// Confirms the destination stored native video, not a link card.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{id_field, GraphClient};
use crate::pipeline::config::VerifyConfig;
use crate::pipeline::errors::{PipelineError, Result};
use crate::pipeline::models::VerificationStatus;

/// Outcome of the verification polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub status: VerificationStatus,
    pub post_id: Option<String>,
    pub polls: u32,
}

/// Parse Graph timestamps (`2024-05-01T12:00:00+0000`), falling back to RFC 3339
pub fn parse_graph_time(value: &str) -> Option<OffsetDateTime> {
    let graph = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
    );
    OffsetDateTime::parse(value, &graph)
        .or_else(|_| OffsetDateTime::parse(value, &Rfc3339))
        .ok()
}

fn attachments(post: &Value) -> Vec<&Value> {
    post.pointer("/attachments/data")
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

fn contains_marker(text: Option<&str>, marker: &str) -> bool {
    !marker.is_empty() && text.is_some_and(|t| t.to_lowercase().contains(&marker.to_lowercase()))
}

fn post_matches(post: &Value, marker: &str, asset_id: &str) -> bool {
    if contains_marker(post.get("message").and_then(Value::as_str), marker) {
        return true;
    }
    attachments(post).into_iter().any(|a| {
        contains_marker(a.get("title").and_then(Value::as_str), marker)
            || a.get("target")
                .and_then(|t| id_field(t, "id"))
                .is_some_and(|id| id == asset_id)
    })
}

fn attachment_status(post: &Value) -> Option<VerificationStatus> {
    let kinds: Vec<String> = attachments(post)
        .into_iter()
        .flat_map(|a| {
            ["media_type", "type"]
                .into_iter()
                .filter_map(|k| a.get(k).and_then(Value::as_str))
                .map(|s| s.to_ascii_lowercase())
                .collect::<Vec<_>>()
        })
        .collect();

    if kinds.iter().any(|k| k.starts_with("video")) {
        Some(VerificationStatus::ConfirmedVideo)
    } else if kinds.iter().any(|k| k == "link" || k == "share") {
        Some(VerificationStatus::Fallback)
    } else {
        None
    }
}

/// Decide from one page of posts; `None` means keep polling
pub fn evaluate_posts(
    posts: &[Value],
    marker: &str,
    asset_id: &str,
    now: OffsetDateTime,
    window: Duration,
) -> Option<(VerificationStatus, Option<String>)> {
    let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);

    posts
        .iter()
        .filter(|post| {
            post.get("created_time")
                .and_then(Value::as_str)
                .and_then(parse_graph_time)
                .map_or(true, |created| now - created <= window)
        })
        .filter(|post| post_matches(post, marker, asset_id))
        .find_map(|post| attachment_status(post).map(|status| (status, id_field(post, "id"))))
}

pub struct PublishVerifier {
    client: GraphClient,
    config: VerifyConfig,
}

impl PublishVerifier {
    pub fn new(client: GraphClient, config: VerifyConfig) -> Self {
        Self { client, config }
    }

    /// One listing request; the outer error is cancellation, the inner one a failed poll
    async fn fetch_posts(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Vec<Value>, String>> {
        let url = format!("{}/{}/posts", self.config.graph_url.trim_end_matches('/'), container_id);
        let request = self
            .client
            .get(&url)
            .query(&[
                (
                    "fields",
                    "id,message,created_time,attachments{media_type,type,title,target}".to_string(),
                ),
                ("limit", self.config.listing_limit.to_string()),
            ])
            .timeout(self.config.poll_timeout);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            response = self.client.send_json(request) => response,
        };
        Ok(response.map_err(|f| f.to_string()).map(|value| {
            value
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        }))
    }

    /// Poll until the post is classified or the poll budget runs out
    pub async fn verify(
        &self,
        container_id: &str,
        asset_id: &str,
        marker: &str,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport> {
        if !self.config.enabled {
            return Ok(VerificationReport {
                status: VerificationStatus::Skipped,
                post_id: None,
                polls: 0,
            });
        }

        for poll in 1..=self.config.max_polls {
            match self.fetch_posts(container_id, cancel).await? {
                Ok(posts) => {
                    let now = OffsetDateTime::now_utc();
                    if let Some((status, post_id)) =
                        evaluate_posts(&posts, marker, asset_id, now, self.config.recency_window)
                    {
                        info!(?status, post_id = ?post_id, poll, "publish verified");
                        return Ok(VerificationReport {
                            status,
                            post_id,
                            polls: poll,
                        });
                    }
                    debug!(poll, posts = posts.len(), "post not visible yet");
                }
                Err(e) => warn!(poll, error = %e, "verification poll failed"),
            }

            if poll < self.config.max_polls {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        Ok(VerificationReport {
            status: VerificationStatus::Unconfirmed,
            post_id: None,
            polls: self.config.max_polls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    fn now() -> OffsetDateTime {
        parse_graph_time("2024-05-01T12:00:00+0000").unwrap()
    }

    #[test]
    fn test_parse_graph_time() {
        let t = parse_graph_time("2024-05-01T11:30:00+0000").unwrap();
        assert_eq!((now() - t).whole_minutes(), 30);
        assert!(parse_graph_time("2024-05-01T11:30:00Z").is_some());
        assert!(parse_graph_time("yesterday").is_none());
    }

    #[test]
    fn test_video_attachment_confirms() {
        let posts = vec![json!({
            "id": "1_2",
            "message": "Sunset timelapse #travel",
            "created_time": "2024-05-01T11:59:00+0000",
            "attachments": {"data": [{"media_type": "video", "type": "video_inline"}]}
        })];
        let (status, post_id) = evaluate_posts(&posts, "sunset timelapse", "v1", now(), HOUR).unwrap();
        assert_eq!(status, VerificationStatus::ConfirmedVideo);
        assert_eq!(post_id.as_deref(), Some("1_2"));
    }

    #[test]
    fn test_link_attachment_is_fallback() {
        let posts = vec![json!({
            "id": "1_3",
            "created_time": "2024-05-01T11:59:00+0000",
            "attachments": {"data": [{"type": "share", "title": "Sunset timelapse"}]}
        })];
        let (status, _) = evaluate_posts(&posts, "Sunset timelapse", "v1", now(), HOUR).unwrap();
        assert_eq!(status, VerificationStatus::Fallback);
    }

    #[test]
    fn test_target_id_matches_without_marker() {
        let posts = vec![json!({
            "id": "1_4",
            "attachments": {"data": [{"media_type": "video", "target": {"id": "v42"}}]}
        })];
        assert!(evaluate_posts(&posts, "unrelated", "v42", now(), HOUR).is_some());
    }

    #[test]
    fn test_old_and_unrelated_posts_are_ignored() {
        let posts = vec![
            json!({
                "id": "old",
                "message": "Sunset timelapse",
                "created_time": "2024-04-01T12:00:00+0000",
                "attachments": {"data": [{"media_type": "video"}]}
            }),
            json!({
                "id": "other",
                "message": "Something else",
                "created_time": "2024-05-01T11:59:00+0000",
                "attachments": {"data": [{"media_type": "video"}]}
            }),
            json!({
                "id": "pending",
                "message": "Sunset timelapse",
                "created_time": "2024-05-01T11:59:00+0000"
            }),
        ];
        assert!(evaluate_posts(&posts, "Sunset timelapse", "v1", now(), HOUR).is_none());
    }

    #[tokio::test]
    async fn test_disabled_verification_is_skipped() {
        let verifier = PublishVerifier::new(
            GraphClient::new(reqwest::Client::new(), "t"),
            VerifyConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let report = verifier
            .verify("page", "v1", "m", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, VerificationStatus::Skipped);
        assert_eq!(report.polls, 0);
    }

    fn stalled_listing_verifier(uri: String, poll_timeout: Duration) -> PublishVerifier {
        PublishVerifier::new(
            GraphClient::new(reqwest::Client::new(), "t"),
            VerifyConfig {
                graph_url: uri,
                max_polls: 2,
                poll_interval: Duration::from_millis(10),
                poll_timeout,
                ..Default::default()
            },
        )
    }

    async fn stalled_listing_server() -> wiremock::MockServer {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page-1/posts"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": []}))
                    .set_delay(Duration::from_secs(8)),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_cancel_interrupts_listing_request() {
        let server = stalled_listing_server().await;
        let verifier = stalled_listing_verifier(server.uri(), Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = verifier.verify("page-1", "v1", "Sunset", &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_slow_listing_times_out_per_poll() {
        let server = stalled_listing_server().await;
        let verifier = stalled_listing_verifier(server.uri(), Duration::from_millis(300));

        let started = std::time::Instant::now();
        let report = verifier
            .verify("page-1", "v1", "Sunset", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, VerificationStatus::Unconfirmed);
        assert_eq!(report.polls, 2);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
