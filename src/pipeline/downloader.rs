// Downloader: ordered fallback over candidates with stagnation detection
//
// One attempt per candidate. An attempt ends on completion, on stagnation
// (no meaningful growth for N consecutive checks), on the per-attempt
// deadline, or on cancellation. Partial files are deleted before moving on.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::DownloadConfig;
use super::diagnostics::{diagnose_page, diagnose_status, diagnose_tool_error, SourceBlockReason};
use super::errors::{PipelineError, Result};
use super::models::{AcquisitionAttempt, AttemptOutcome, Candidate, DownloadedAsset};
use super::probe::is_html;
use super::storage::RunWorkspace;
use super::traits::{AcquisitionBackend, FetchReport};

const SNIFF_BYTES: usize = 64 * 1024;

/// Tracks received-byte growth between periodic checks
#[derive(Debug, Clone)]
pub struct StagnationMonitor {
    min_delta: u64,
    max_checks: u32,
    last: u64,
    stalled: u32,
}

impl StagnationMonitor {
    pub fn new(min_delta: u64, max_checks: u32) -> Self {
        Self {
            min_delta,
            max_checks,
            last: 0,
            stalled: 0,
        }
    }

    /// Record the byte count at a check; true once the transfer counts as stagnant
    pub fn observe(&mut self, received: u64) -> bool {
        if received.saturating_sub(self.last) < self.min_delta {
            self.stalled += 1;
        } else {
            self.stalled = 0;
        }
        self.last = received;
        self.stalled >= self.max_checks
    }

    pub fn stalled_checks(&self) -> u32 {
        self.stalled
    }
}

enum Transfer {
    Done(Result<FetchReport>),
    Stagnant,
    TimedOut,
    Cancelled,
}

enum AttemptResult {
    Accepted(DownloadedAsset, AcquisitionAttempt),
    Rejected(AcquisitionAttempt),
}

/// Executes candidates in order until one yields an acceptable asset
pub struct Downloader {
    backends: Vec<Box<dyn AcquisitionBackend>>,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            backends: Vec::new(),
            config,
        }
    }

    pub fn add_backend(&mut self, backend: Box<dyn AcquisitionBackend>) {
        self.backends.push(backend);
    }

    /// Try `candidates` in order, appending one attempt record per candidate to `trail`.
    ///
    /// Returns the first asset that passes the size floor and content checks.
    /// Cancellation, disk exhaustion and local I/O errors abort immediately.
    pub async fn acquire(
        &self,
        candidates: &[Candidate],
        size_hint: Option<u64>,
        workspace: &RunWorkspace,
        trail: &mut Vec<AcquisitionAttempt>,
        cancel: &CancellationToken,
    ) -> Result<DownloadedAsset> {
        let floor = self.config.size_floor(size_hint);

        for candidate in candidates {
            let Some(backend) = self.backends.iter().find(|b| b.handles(candidate.kind)) else {
                trail.push(
                    AcquisitionAttempt::new(candidate, AttemptOutcome::Failed)
                        .with_detail("no backend for this strategy"),
                );
                continue;
            };

            info!(
                strategy = %candidate.strategy_id,
                backend = backend.name(),
                url = %candidate.url,
                "trying candidate"
            );

            match self
                .attempt(backend.as_ref(), candidate, floor, workspace, cancel)
                .await?
            {
                AttemptResult::Accepted(asset, attempt) => {
                    info!(strategy = %candidate.strategy_id, size = asset.size(), "✓ acquired source");
                    trail.push(attempt);
                    return Ok(asset);
                }
                AttemptResult::Rejected(attempt) => {
                    warn!(
                        strategy = %candidate.strategy_id,
                        outcome = ?attempt.outcome,
                        detail = attempt.detail.as_deref().unwrap_or(""),
                        "✗ candidate failed"
                    );
                    trail.push(attempt);
                }
            }
        }

        Err(PipelineError::acquisition_failed(trail.clone()))
    }

    async fn attempt(
        &self,
        backend: &dyn AcquisitionBackend,
        candidate: &Candidate,
        floor: u64,
        workspace: &RunWorkspace,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult> {
        let path = workspace.temp_path("src-", ".bin")?;
        let mut reservation = workspace.reserve(0)?;
        let received = AtomicU64::new(0);
        let mut monitor = StagnationMonitor::new(
            self.config.stagnation_min_delta_bytes,
            self.config.stagnation_max_checks,
        );

        let interval = self.config.stagnation_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);

        let transfer = {
            let fetch = backend.fetch(candidate, &path, &received, &mut reservation, cancel);
            tokio::pin!(fetch);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Transfer::Cancelled,
                    result = &mut fetch => break Transfer::Done(result),
                    _ = &mut deadline => break Transfer::TimedOut,
                    _ = ticker.tick() => {
                        if monitor.observe(received.load(Ordering::Acquire)) {
                            break Transfer::Stagnant;
                        }
                    }
                }
            }
        };

        let got = received.load(Ordering::Acquire);
        let rejected = |outcome: AttemptOutcome, detail: String| {
            Ok(AttemptResult::Rejected(
                AcquisitionAttempt::new(candidate, outcome)
                    .with_size(Some(got))
                    .with_detail(detail),
            ))
        };

        let report = match transfer {
            Transfer::Cancelled => return Err(PipelineError::Cancelled),
            Transfer::TimedOut => {
                return rejected(
                    AttemptOutcome::TimedOut,
                    format!("attempt exceeded {:?}", self.config.attempt_timeout),
                )
            }
            Transfer::Stagnant => {
                return rejected(
                    AttemptOutcome::Stagnant,
                    format!(
                        "no growth above {} bytes for {} checks of {:?}",
                        self.config.stagnation_min_delta_bytes,
                        monitor.stalled_checks(),
                        interval
                    ),
                )
            }
            Transfer::Done(Err(e)) => {
                return Ok(AttemptResult::Rejected(classify_failure(candidate, e, got)?));
            }
            Transfer::Done(Ok(report)) => report,
        };

        let content_type = report.content_type.clone();

        if let Some(expected) = report.expected_len {
            if report.bytes < expected {
                return Ok(AttemptResult::Rejected(
                    AcquisitionAttempt::new(candidate, AttemptOutcome::Incomplete)
                        .with_size(Some(report.bytes))
                        .with_content_type(content_type)
                        .with_detail(format!("received {} of {} announced bytes", report.bytes, expected)),
                ));
            }
        }

        if is_html(content_type.as_deref()) {
            let head = sniff(&path).await?;
            if looks_like_markup(&head) {
                let reason = diagnose_page(&head).unwrap_or(SourceBlockReason::Unknown);
                return Ok(AttemptResult::Rejected(
                    AcquisitionAttempt::new(candidate, AttemptOutcome::AuthRequired)
                        .with_size(Some(report.bytes))
                        .with_content_type(content_type)
                        .with_block_reason(Some(reason))
                        .with_detail("host returned an HTML page instead of the file"),
                ));
            }
        }

        if report.bytes < floor {
            return Ok(AttemptResult::Rejected(
                AcquisitionAttempt::new(candidate, AttemptOutcome::Incomplete)
                    .with_size(Some(report.bytes))
                    .with_content_type(content_type)
                    .with_detail(format!("{} bytes is below the {} byte floor", report.bytes, floor)),
            ));
        }

        reservation.settle(report.bytes)?;
        let attempt = AcquisitionAttempt::new(candidate, AttemptOutcome::Ok)
            .with_size(Some(report.bytes))
            .with_content_type(content_type.clone());
        let asset = DownloadedAsset::new(
            path,
            report.bytes,
            content_type,
            candidate.strategy_id.clone(),
            reservation,
        );
        Ok(AttemptResult::Accepted(asset, attempt))
    }
}

/// Map a backend error to an attempt record; fatal errors pass through
fn classify_failure(candidate: &Candidate, err: PipelineError, received: u64) -> Result<AcquisitionAttempt> {
    let attempt = |outcome| AcquisitionAttempt::new(candidate, outcome).with_size(Some(received));

    let record = match err {
        PipelineError::Cancelled | PipelineError::DiskExhausted { .. } | PipelineError::Io(_) => {
            return Err(err)
        }
        PipelineError::Network(e) => {
            let detail = e.to_string();
            if let Some(status) = e.status() {
                let reason = diagnose_status(status.as_u16());
                let outcome = if reason.is_some_and(|r| r.is_auth_related()) {
                    AttemptOutcome::AuthRequired
                } else {
                    AttemptOutcome::Unreachable
                };
                attempt(outcome).with_block_reason(reason).with_detail(detail)
            } else if e.is_timeout() {
                attempt(AttemptOutcome::TimedOut)
                    .with_block_reason(Some(SourceBlockReason::NetworkTimeout))
                    .with_detail(detail)
            } else if received > 0 {
                attempt(AttemptOutcome::Incomplete).with_detail(detail)
            } else {
                let reason = e.is_connect().then_some(SourceBlockReason::NetworkTimeout);
                attempt(AttemptOutcome::Unreachable)
                    .with_block_reason(reason)
                    .with_detail(detail)
            }
        }
        PipelineError::ToolTimeout { .. } => attempt(AttemptOutcome::TimedOut).with_detail(err.to_string()),
        PipelineError::ToolFailed { ref message, .. } => {
            let reason = diagnose_tool_error(message);
            let outcome = if reason.is_some_and(|r| r.is_auth_related()) {
                AttemptOutcome::AuthRequired
            } else {
                AttemptOutcome::Failed
            };
            attempt(outcome).with_block_reason(reason).with_detail(err.to_string())
        }
        other => attempt(AttemptOutcome::Failed).with_detail(other.to_string()),
    };
    Ok(record)
}

async fn sniff(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64).read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn looks_like_markup(head: &str) -> bool {
    let lower = head.trim_start().to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html") || lower.contains("<html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::StorageConfig;
    use crate::pipeline::models::StrategyKind;
    use crate::pipeline::storage::{DiskBudget, DiskReservation};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Behaviour is picked from the candidate url
    struct ScriptedBackend;

    async fn write_bytes(
        dest: &Path,
        data: &[u8],
        received: &AtomicU64,
        reservation: &mut DiskReservation,
    ) -> Result<()> {
        reservation.grow_to(data.len() as u64)?;
        tokio::fs::write(dest, data).await?;
        received.store(data.len() as u64, Ordering::Release);
        Ok(())
    }

    #[async_trait]
    impl AcquisitionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
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
            match candidate.url.as_str() {
                "stall" => {
                    write_bytes(dest, &[0u8; 10], received, reservation).await?;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!("stalled transfer must be aborted")
                }
                "html" => {
                    let page = b"<!DOCTYPE html><html>You need access</html>";
                    write_bytes(dest, page, received, reservation).await?;
                    Ok(FetchReport {
                        bytes: page.len() as u64,
                        content_type: Some("text/html".to_string()),
                        expected_len: Some(page.len() as u64),
                    })
                }
                "small" => {
                    write_bytes(dest, &[1u8; 100], received, reservation).await?;
                    Ok(FetchReport {
                        bytes: 100,
                        content_type: Some("video/mp4".to_string()),
                        expected_len: None,
                    })
                }
                "truncated" => {
                    write_bytes(dest, &[1u8; 5000], received, reservation).await?;
                    Ok(FetchReport {
                        bytes: 5000,
                        content_type: Some("video/mp4".to_string()),
                        expected_len: Some(9000),
                    })
                }
                _ => {
                    write_bytes(dest, &[7u8; 4096], received, reservation).await?;
                    Ok(FetchReport {
                        bytes: 4096,
                        content_type: Some("video/mp4".to_string()),
                        expected_len: Some(4096),
                    })
                }
            }
        }
    }

    fn candidates(urls: &[&str]) -> Vec<Candidate> {
        urls.iter()
            .enumerate()
            .map(|(index, url)| Candidate {
                index,
                strategy_id: format!("s{}", index),
                kind: StrategyKind::HttpStream,
                url: url.to_string(),
            })
            .collect()
    }

    fn downloader() -> Downloader {
        let mut d = Downloader::new(DownloadConfig {
            stagnation_interval: Duration::from_millis(20),
            stagnation_min_delta_bytes: 1,
            stagnation_max_checks: 2,
            attempt_timeout: Duration::from_secs(10),
            absolute_floor_bytes: 1000,
            size_hint_tolerance: 0.95,
        });
        d.add_backend(Box::new(ScriptedBackend));
        d
    }

    fn workspace(root: &Path) -> (RunWorkspace, std::sync::Arc<DiskBudget>) {
        let config = StorageConfig {
            work_dir: root.to_path_buf(),
            max_run_bytes: 1 << 20,
            max_total_bytes: 1 << 20,
        };
        let global = DiskBudget::new(config.max_total_bytes);
        (RunWorkspace::create(&config, &global, "test-run").unwrap(), global)
    }

    #[test]
    fn test_monitor_needs_consecutive_stalls() {
        let mut m = StagnationMonitor::new(100, 3);
        assert!(!m.observe(50));
        assert!(!m.observe(60));
        assert!(!m.observe(500));
        assert!(!m.observe(550));
        assert!(!m.observe(560));
        assert!(m.observe(570));
    }

    #[tokio::test]
    async fn test_falls_back_until_a_candidate_passes() {
        let root = tempfile::tempdir().unwrap();
        let (ws, global) = workspace(root.path());
        let mut trail = Vec::new();

        let asset = downloader()
            .acquire(
                &candidates(&["html", "stall", "small", "truncated", "good"]),
                None,
                &ws,
                &mut trail,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let outcomes: Vec<AttemptOutcome> = trail.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::AuthRequired,
                AttemptOutcome::Stagnant,
                AttemptOutcome::Incomplete,
                AttemptOutcome::Incomplete,
                AttemptOutcome::Ok,
            ]
        );
        assert_eq!(asset.size(), 4096);
        assert_eq!(asset.produced_by(), "s4");
        // only the accepted file is left in the workspace
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 1);
        assert_eq!(global.used(), 4096);

        drop(asset);
        assert_eq!(global.used(), 0);
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_size_hint_raises_floor() {
        let root = tempfile::tempdir().unwrap();
        let (ws, _global) = workspace(root.path());
        let mut trail = Vec::new();

        let err = downloader()
            .acquire(&candidates(&["good"]), Some(10_000), &ws, &mut trail, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::pipeline::errors::ErrorKind::SourceIncomplete);
        assert_eq!(trail.len(), 1);
        assert_eq!(err.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_attempt() {
        let root = tempfile::tempdir().unwrap();
        let (ws, _global) = workspace(root.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut trail = Vec::new();

        let err = downloader()
            .acquire(&candidates(&["stall"]), None, &ws, &mut trail, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }
}
