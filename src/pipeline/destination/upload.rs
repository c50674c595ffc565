// Upload session manager: direct or three-phase chunked upload
//
// start -> transfer (bounded concurrency, per-chunk retry) -> finish.
// A chunk that exhausts its retries cancels its siblings and `finish` is
// never sent, so the destination session expires on its own.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::{id_field, GraphClient, GraphFailure};
use crate::pipeline::config::UploadConfig;
use crate::pipeline::errors::{PipelineError, Result};
use crate::pipeline::models::{DownloadedAsset, PostMetadata};
use crate::pipeline::retry::{retry_with_backoff, RetryAction, RetryPolicy};

/// Name the destination sees for a direct upload; work files carry no useful name
const DIRECT_FILE_NAME: &str = "video.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Start,
    Transfer,
    Finish,
}

/// Destination-side upload session, one per run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub asset_id: String,
    pub phase: UploadPhase,
    /// End of the contiguous acknowledged prefix
    pub next_offset: u64,
    pub chunk_size: u64,
    pub file_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Acknowledged spans past `next_offset`, keyed by offset
    #[serde(skip)]
    acked: BTreeMap<u64, u64>,
}

impl UploadSession {
    /// Record a transferred chunk and advance `next_offset` over any gap it closes
    pub fn acknowledge(&mut self, span: ChunkSpan) {
        self.acked.insert(span.offset, span.offset + span.len);
        while let Some(end) = self.acked.remove(&self.next_offset) {
            self.next_offset = end;
        }
    }
}

/// One planned chunk `[offset, offset + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub len: u64,
}

/// Fixed-size chunk plan that covers `[0, size)` exactly once
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    if chunk_size == 0 {
        return Vec::new();
    }
    std::iter::successors(Some(0u64), |offset| offset.checked_add(chunk_size))
        .take_while(|offset| *offset < size)
        .map(|offset| ChunkSpan {
            offset,
            len: chunk_size.min(size - offset),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Direct,
    Chunked,
}

/// What a successful upload produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub asset_id: String,
    pub mode: UploadMode,
    pub chunks: usize,
}

/// Descriptive fields sent with a direct upload or with `finish`
pub fn metadata_fields(metadata: &PostMetadata, max_tags: usize, max_tag_len: usize) -> Vec<(String, String)> {
    let mut fields = vec![
        ("title".to_string(), metadata.title.clone()),
        ("description".to_string(), metadata.description.clone()),
        (
            "privacy".to_string(),
            format!(r#"{{"value":"{}"}}"#, metadata.visibility.privacy_value()),
        ),
    ];
    if metadata.visibility.is_secret() {
        fields.push(("secret".to_string(), "true".to_string()));
    }
    let tags = metadata.normalized_tags(max_tags, max_tag_len);
    if !tags.is_empty() {
        fields.push(("tags".to_string(), tags.join(",")));
    }
    fields
}

pub struct UploadSessionManager {
    client: GraphClient,
    config: UploadConfig,
}

impl UploadSessionManager {
    pub fn new(client: GraphClient, config: UploadConfig) -> Self {
        Self { client, config }
    }

    fn videos_url(&self, container_id: &str) -> String {
        format!(
            "{}/{}/videos",
            self.config.graph_video_url.trim_end_matches('/'),
            container_id
        )
    }

    /// Upload `asset`, direct below the threshold and chunked above it
    pub async fn upload(
        &self,
        asset: &DownloadedAsset,
        container_id: &str,
        metadata: &PostMetadata,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt> {
        if asset.size() < self.config.direct_threshold_bytes {
            info!(size = asset.size(), "direct upload");
            let asset_id = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                r = self.upload_direct(asset, container_id, metadata) => r?,
            };
            return Ok(UploadReceipt {
                asset_id,
                mode: UploadMode::Direct,
                chunks: 0,
            });
        }

        let mut session = self.start(asset.size(), container_id, cancel).await?;
        let chunks = self.transfer(&mut session, asset.path(), container_id, cancel).await?;
        self.finish(&mut session, container_id, metadata, cancel).await?;

        Ok(UploadReceipt {
            asset_id: session.asset_id,
            mode: UploadMode::Chunked,
            chunks,
        })
    }

    async fn upload_direct(
        &self,
        asset: &DownloadedAsset,
        container_id: &str,
        metadata: &PostMetadata,
    ) -> Result<String> {
        let file = tokio::fs::File::open(asset.path()).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, asset.size())
            .file_name(DIRECT_FILE_NAME)
            .mime_str("video/mp4")?;

        let mut form = Form::new().part("source", part);
        for (key, value) in metadata_fields(metadata, self.config.max_tags, self.config.max_tag_len) {
            form = form.text(key, value);
        }

        let request = self
            .client
            .post(&self.videos_url(container_id))
            .timeout(self.config.phase_timeout)
            .multipart(form);

        let value = self.client.send_json(request).await.map_err(rejected_session)?;
        id_field(&value, "id")
            .or_else(|| id_field(&value, "video_id"))
            .ok_or_else(|| PipelineError::UploadSessionRejected {
                status: None,
                message: "direct upload response carried no id".to_string(),
            })
    }

    /// Phase 1: open the session
    pub async fn start(&self, file_size: u64, container_id: &str, cancel: &CancellationToken) -> Result<UploadSession> {
        let request = self
            .client
            .post(&self.videos_url(container_id))
            .timeout(self.config.phase_timeout)
            .query(&[("upload_phase", "start".to_string()), ("file_size", file_size.to_string())]);

        let value = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            r = self.client.send_json(request) => r.map_err(rejected_session)?,
        };

        let session_id = id_field(&value, "upload_session_id");
        let asset_id = id_field(&value, "video_id");
        let (Some(session_id), Some(asset_id)) = (session_id, asset_id) else {
            return Err(PipelineError::UploadSessionRejected {
                status: None,
                message: format!("start response missing session fields: {}", value),
            });
        };

        info!(%session_id, %asset_id, file_size, "upload session started");
        Ok(UploadSession {
            session_id,
            asset_id,
            phase: UploadPhase::Start,
            next_offset: 0,
            chunk_size: self.config.chunk_size_bytes,
            file_size,
            created_at: OffsetDateTime::now_utc(),
            acked: BTreeMap::new(),
        })
    }

    /// Phase 2: send every chunk; returns the number of chunks sent
    pub async fn transfer(
        &self,
        session: &mut UploadSession,
        path: &Path,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        session.phase = UploadPhase::Transfer;
        let plan = plan_chunks(session.file_size, session.chunk_size);
        let total = plan.len();
        let url = self.videos_url(container_id);
        let policy = RetryPolicy::new(
            self.config.max_chunk_retries,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        );
        let siblings = cancel.child_token();
        let session_id = session.session_id.clone();

        let mut results = futures::stream::iter(plan.into_iter().map(|span| {
            let url = &url;
            let policy = &policy;
            let siblings = &siblings;
            let session_id = &session_id;
            async move {
                let data = read_span(path, span).await?;
                self.send_chunk(url, session_id, span, data, policy, siblings).await?;
                Ok(span)
            }
        }))
        .buffer_unordered(self.config.max_concurrent_chunks);

        let mut done = 0usize;
        while let Some(result) = results.next().await {
            let span = match result {
                Ok(span) => span,
                Err(e) => {
                    siblings.cancel();
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    return Err(e);
                }
            };
            session.acknowledge(span);
            done += 1;
            debug!(done, total, next_offset = session.next_offset, "chunk transferred");
        }

        info!(chunks = total, "all chunks transferred");
        Ok(total)
    }

    async fn send_chunk(
        &self,
        url: &str,
        session_id: &str,
        span: ChunkSpan,
        data: Bytes,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        retry_with_backoff(policy, cancel, |attempt| {
            let data = data.clone();
            async move {
                let part = match Part::stream_with_length(Body::from(data), span.len)
                    .file_name("chunk")
                    .mime_str("application/octet-stream")
                {
                    Ok(part) => part,
                    Err(e) => return RetryAction::Fail(e.into()),
                };
                let request = self
                    .client
                    .post(url)
                    .timeout(self.config.chunk_timeout)
                    .query(&[
                        ("upload_phase", "transfer".to_string()),
                        ("upload_session_id", session_id.to_string()),
                        ("start_offset", span.offset.to_string()),
                    ])
                    .multipart(Form::new().part("video_file_chunk", part));

                let sent = tokio::select! {
                    _ = cancel.cancelled() => return RetryAction::Fail(PipelineError::Cancelled),
                    r = self.client.send_json(request) => r,
                };

                match sent {
                    Ok(_) => RetryAction::Success(()),
                    Err(failure) => {
                        let err = PipelineError::ChunkTransferFailed {
                            offset: span.offset,
                            attempts: attempt + 1,
                            message: failure.to_string(),
                        };
                        if failure.is_permanent() {
                            RetryAction::Fail(err)
                        } else {
                            RetryAction::Retry(err)
                        }
                    }
                }
            }
        })
        .await
    }

    /// Phase 3: close the session and publish with metadata
    pub async fn finish(
        &self,
        session: &mut UploadSession,
        container_id: &str,
        metadata: &PostMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        session.phase = UploadPhase::Finish;
        let request = self
            .client
            .post(&self.videos_url(container_id))
            .timeout(self.config.phase_timeout)
            .query(&[
                ("upload_phase", "finish".to_string()),
                ("upload_session_id", session.session_id.clone()),
            ])
            .form(&metadata_fields(metadata, self.config.max_tags, self.config.max_tag_len));

        let value = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            r = self.client.send_json(request) => r.map_err(|f| PipelineError::UploadFinishRejected {
                message: f.to_string(),
            })?,
        };

        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(PipelineError::UploadFinishRejected {
                message: format!("finish returned {}", value),
            });
        }
        info!(asset_id = %session.asset_id, "upload finished");
        Ok(())
    }
}

fn rejected_session(failure: GraphFailure) -> PipelineError {
    PipelineError::UploadSessionRejected {
        status: failure.status,
        message: failure.to_string(),
    }
}

async fn read_span(path: &Path, span: ChunkSpan) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(span.offset)).await?;
    let len = usize::try_from(span.len)
        .map_err(|_| PipelineError::Config(format!("chunk of {} bytes cannot be buffered", span.len)))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::Visibility;

    #[test]
    fn test_600mb_in_4mb_chunks() {
        let size = 600 * 1024 * 1024;
        let chunk = 4 * 1024 * 1024;
        let plan = plan_chunks(size, chunk);
        assert_eq!(plan.len(), 150);
        for (i, span) in plan.iter().enumerate() {
            assert_eq!(span.offset, i as u64 * chunk);
            assert_eq!(span.len, chunk);
        }
    }

    #[test]
    fn test_plan_partitions_uneven_sizes() {
        for (size, chunk) in [(1u64, 4u64), (10, 3), (12, 4), (4_194_305, 4_194_304)] {
            let plan = plan_chunks(size, chunk);
            let mut expected = 0;
            for span in &plan {
                assert_eq!(span.offset, expected);
                assert!(span.len > 0 && span.len <= chunk);
                expected += span.len;
            }
            assert_eq!(expected, size);
        }
        assert!(plan_chunks(0, 4).is_empty());
    }

    #[test]
    fn test_metadata_fields() {
        let meta = PostMetadata::new("Launch")
            .with_description("Our new thing")
            .with_visibility(Visibility::Private)
            .with_tags(vec!["#launch".into(), "product".into()]);
        let fields = metadata_fields(&meta, 10, 32);
        assert!(fields.contains(&("privacy".to_string(), r#"{"value":"SELF"}"#.to_string())));
        assert!(fields.contains(&("tags".to_string(), "launch,product".to_string())));
    }

    #[test]
    fn test_unlisted_is_public_but_secret() {
        let meta = PostMetadata::new("t").with_visibility(Visibility::Unlisted);
        let fields = metadata_fields(&meta, 10, 32);
        assert!(fields.contains(&("privacy".to_string(), r#"{"value":"EVERYONE"}"#.to_string())));
        assert!(fields.contains(&("secret".to_string(), "true".to_string())));

        let public = metadata_fields(&PostMetadata::new("t"), 10, 32);
        assert!(public.iter().all(|(k, _)| k != "secret"));
    }

    #[test]
    fn test_next_offset_tracks_contiguous_prefix() {
        let mut session = UploadSession {
            session_id: "s".to_string(),
            asset_id: "v".to_string(),
            phase: UploadPhase::Transfer,
            next_offset: 0,
            chunk_size: 10,
            file_size: 25,
            created_at: OffsetDateTime::UNIX_EPOCH,
            acked: BTreeMap::new(),
        };
        let plan = plan_chunks(25, 10);

        session.acknowledge(plan[1]);
        assert_eq!(session.next_offset, 0);
        session.acknowledge(plan[2]);
        assert_eq!(session.next_offset, 0);
        session.acknowledge(plan[0]);
        assert_eq!(session.next_offset, 25);
    }

    #[test]
    fn test_chunk_size_larger_than_file() {
        assert_eq!(plan_chunks(5, u64::MAX), vec![ChunkSpan { offset: 0, len: 5 }]);
    }

    #[test]
    fn test_no_tags_field_when_empty() {
        let fields = metadata_fields(&PostMetadata::new("t"), 10, 32);
        assert!(fields.iter().all(|(k, _)| k != "tags"));
    }
}
