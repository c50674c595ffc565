// Extraction-tool backend: yt-dlp writes the file, we watch it grow
//
// yt-dlp picks the final extension itself (and writes per-format parts
// before merging), so each attempt gets its own scratch directory. Growth
// is the total size of that directory; the finished file is moved onto the
// attempt's destination path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::errors::{PipelineError, Result};
use crate::pipeline::models::{Candidate, StrategyKind};
use crate::pipeline::storage::DiskReservation;
use crate::pipeline::tools::{ToolInvocation, ToolRunner};
use crate::pipeline::traits::{AcquisitionBackend, FetchReport};

/// File stem of the output template inside the scratch directory
const OUTPUT_STEM: &str = "media";

/// Leftovers yt-dlp may write next to the real output
const SCRATCH_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

pub struct ExtractorBackend {
    runner: Arc<dyn ToolRunner>,
    binary: String,
    proxy: Option<String>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ExtractorBackend {
    pub fn new(runner: Arc<dyn ToolRunner>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            proxy: None,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build command arguments; output lands in `scratch_dir` as `media.<ext>`
    pub fn build_args(&self, url: &str, scratch_dir: &Path) -> Vec<String> {
        let template = scratch_dir.join(format!("{}.%(ext)s", OUTPUT_STEM));
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "--no-part".to_string(),
            "--force-overwrites".to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
            "--retries".to_string(),
            "3".to_string(),
            "-f".to_string(),
            "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
        ];

        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        args.push(url.to_string());
        args
    }
}

/// Total size of the regular files directly inside `dir`
async fn dir_len(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut total = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

fn is_scratch(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    SCRATCH_SUFFIXES.iter().any(|s| name.ends_with(*s))
}

/// Locate the finished file: the printed path if it exists, else `media.<ext>`
/// in the scratch directory, else its largest non-scratch file
async fn find_output(scratch_dir: &Path, stdout: &str) -> Option<PathBuf> {
    if let Some(printed) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        let printed = PathBuf::from(printed);
        if printed.starts_with(scratch_dir) && tokio::fs::metadata(&printed).await.is_ok_and(|m| m.is_file()) {
            return Some(printed);
        }
    }

    let mut entries = tokio::fs::read_dir(scratch_dir).await.ok()?;
    let mut named = None;
    let mut largest: Option<(u64, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() || is_scratch(&path) {
            continue;
        }
        if path.file_stem().is_some_and(|s| s == OUTPUT_STEM) {
            named = Some(path.clone());
        }
        if largest.as_ref().map_or(true, |(len, _)| meta.len() > *len) {
            largest = Some((meta.len(), path));
        }
    }
    named.or(largest.map(|(_, path)| path))
}

#[async_trait]
impl AcquisitionBackend for ExtractorBackend {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn handles(&self, kind: StrategyKind) -> bool {
        kind == StrategyKind::ExtractorTool
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        dest: &Path,
        received: &AtomicU64,
        reservation: &mut DiskReservation,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new().prefix("extract-").tempdir_in(parent)?;

        let invocation = ToolInvocation::new(
            self.binary.clone(),
            self.build_args(&candidate.url, scratch.path()),
            self.timeout,
        );
        debug!(tool = %self.binary, url = %candidate.url, dir = %scratch.path().display(), "starting extraction");

        let run = self.runner.run(invocation, cancel);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.poll_interval);

        let output = loop {
            tokio::select! {
                output = &mut run => break output?,
                _ = ticker.tick() => {
                    let len = dir_len(scratch.path()).await;
                    reservation.grow_to(len)?;
                    received.store(len, Ordering::Release);
                }
            }
        };

        if !output.success() {
            let tail = output.stderr_tail(5);
            return Err(PipelineError::tool_failed(
                &self.binary,
                if tail.is_empty() {
                    format!("exit code {:?}", output.exit_code)
                } else {
                    tail
                },
            ));
        }

        // Parts still on disk count until the move
        reservation.grow_to(dir_len(scratch.path()).await)?;

        let produced = find_output(scratch.path(), &output.stdout_lossy())
            .await
            .ok_or_else(|| PipelineError::tool_failed(&self.binary, "finished without writing a media file"))?;
        tokio::fs::rename(&produced, dest).await?;

        let bytes = tokio::fs::metadata(dest).await?.len();
        reservation.settle(bytes)?;
        received.store(bytes, Ordering::Release);
        debug!(file = %produced.display(), bytes, "extraction finished");

        Ok(FetchReport {
            bytes,
            content_type: Some("video/mp4".to_string()),
            expected_len: None,
        })
    }
}
