// HTTP streaming backend (generic hosts, Drive templates, Dropbox)

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::errors::Result;
use crate::pipeline::models::{Candidate, StrategyKind};
use crate::pipeline::probe::normalize_content_type;
use crate::pipeline::storage::DiskReservation;
use crate::pipeline::traits::{AcquisitionBackend, FetchReport};

pub struct HttpStreamBackend {
    client: reqwest::Client,
}

impl HttpStreamBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AcquisitionBackend for HttpStreamBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn handles(&self, kind: StrategyKind) -> bool {
        kind == StrategyKind::HttpStream
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        dest: &Path,
        received: &AtomicU64,
        reservation: &mut DiskReservation,
        _cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let response = self
            .client
            .get(&candidate.url)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(normalize_content_type)
            .filter(|ct| !ct.is_empty());
        let expected_len = response.content_length();

        debug!(
            url = %candidate.url,
            content_type = ?content_type,
            expected_len = ?expected_len,
            "streaming source"
        );

        if let Some(len) = expected_len {
            reservation.grow_to(len)?;
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let next = written + chunk.len() as u64;
            reservation.grow_to(next)?;
            file.write_all(&chunk).await?;
            written = next;
            received.store(written, Ordering::Release);
        }
        file.flush().await?;

        Ok(FetchReport {
            bytes: written,
            content_type,
            expected_len,
        })
    }
}
