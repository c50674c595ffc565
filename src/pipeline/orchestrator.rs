// Orchestrator: drives one publish run through every stage
//
// Resolving → Probing → Acquiring → Transcoding → Uploading → Verifying → Done.
// Stages only move forward; any error short-circuits to cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backends::{ExtractorBackend, HttpStreamBackend};
use super::config::PipelineConfig;
use super::destination::{CredentialReport, GraphClient, PublishVerifier, UploadMode, UploadSessionManager};
use super::downloader::Downloader;
use super::errors::{ErrorKind, PipelineError, Result};
use super::models::{
    AcquisitionAttempt, DestinationTarget, Diagnostic, PipelineStage, PublishRequest, PublishResult,
    VerificationStatus,
};
use super::probe::ProbeExecutor;
use super::resolver::{ResolvedSource, SourceResolver};
use super::storage::{DiskBudget, RunWorkspace};
use super::tools::{check_tools, ProcessToolRunner, ToolInfo, ToolRunner};
use super::transcode::TranscodeEngine;

/// Mutable state of a single run, turned into a `PublishResult` at the end
struct RunState {
    run_id: String,
    stage: PipelineStage,
    diagnostics: Vec<Diagnostic>,
    attempts: Vec<AcquisitionAttempt>,
    asset_id: Option<String>,
    verification: VerificationStatus,
    size_bytes: Option<u64>,
    strategy_used: Option<String>,
    profile_used: Option<String>,
}

impl RunState {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            stage: PipelineStage::Resolving,
            diagnostics: Vec::new(),
            attempts: Vec::new(),
            asset_id: None,
            verification: VerificationStatus::Skipped,
            size_bytes: None,
            strategy_used: None,
            profile_used: None,
        }
    }

    /// Move to `stage`; going backwards is a bug
    fn enter(&mut self, stage: PipelineStage, cancel: &CancellationToken) -> Result<()> {
        if stage < self.stage {
            return Err(PipelineError::Config(format!(
                "stage transition {} → {} is not allowed",
                self.stage, stage
            )));
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        debug!(from = %self.stage, to = %stage, "stage transition");
        self.stage = stage;
        Ok(())
    }

    fn note(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::info(self.stage, message));
    }

    fn finish(mut self, outcome: Result<()>) -> PublishResult {
        let (success, error, hint) = match outcome {
            Ok(()) => (true, None, None),
            Err(e) => {
                if matches!(e, PipelineError::Cancelled) {
                    warn!(stage = %self.stage, "run cancelled");
                } else {
                    warn!(stage = %self.stage, error = %e, "✗ run failed");
                }
                let hint = e.hint();
                self.diagnostics
                    .push(Diagnostic::error(self.stage, e.kind(), e.to_string(), hint.clone()));
                if self.attempts.is_empty() {
                    self.attempts = e.attempts().to_vec();
                }
                (false, Some(e.kind()), hint)
            }
        };

        PublishResult {
            success,
            run_id: self.run_id,
            asset_id: self.asset_id,
            verification: self.verification,
            verified: self.verification == VerificationStatus::ConfirmedVideo,
            size_bytes: self.size_bytes,
            strategy_used: self.strategy_used,
            profile_used: self.profile_used,
            error,
            hint,
            attempts: self.attempts,
            diagnostics: self.diagnostics,
        }
    }
}

/// Entry point of the relay: owns the shared HTTP client, tool runner and disk budget
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    http: reqwest::Client,
    runner: Arc<dyn ToolRunner>,
    budget: Arc<DiskBudget>,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let http = config.network.build_client()?;
        let budget = DiskBudget::new(config.storage.max_total_bytes);
        Ok(Self {
            config,
            http,
            runner: Arc::new(ProcessToolRunner::new()),
            budget,
        })
    }

    /// Replace the process-backed runner (tests use a fake)
    pub fn with_tool_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Share one disk budget between several orchestrators
    pub fn with_disk_budget(mut self, budget: Arc<DiskBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn disk_budget(&self) -> &Arc<DiskBudget> {
        &self.budget
    }

    /// Resolve a reference without touching the network
    pub fn resolve(&self, raw: &str) -> Result<ResolvedSource> {
        let reference = super::models::MediaSourceReference::new(raw);
        SourceResolver::new(self.config.resolver.clone()).resolve(&reference)
    }

    /// Check that the credential can read the destination container
    pub async fn check_credentials(&self, destination: &DestinationTarget) -> Result<CredentialReport> {
        GraphClient::new(self.http.clone(), destination.access_token.clone())
            .check_credentials(
                &self.config.verify.graph_url,
                &destination.container_id,
                self.config.verify.poll_timeout,
            )
            .await
    }

    pub fn tool_report(&self) -> Vec<ToolInfo> {
        check_tools(&self.config.tools)
    }

    fn downloader(&self) -> Downloader {
        let mut downloader = Downloader::new(self.config.download.clone());
        downloader.add_backend(Box::new(HttpStreamBackend::new(self.http.clone())));
        downloader.add_backend(Box::new(
            ExtractorBackend::new(
                self.runner.clone(),
                self.config.tools.ytdlp.clone(),
                self.config.download.attempt_timeout,
            )
            .with_proxy(self.config.network.proxy.clone())
            .with_poll_interval(self.config.download.stagnation_interval.min(Duration::from_secs(1))),
        ));
        downloader
    }

    /// Run one publish end to end.
    ///
    /// Never panics and never returns an error: failures are reported in the
    /// result together with the attempt trail and a remediation hint. The run
    /// workspace and every intermediate file are gone when this returns.
    pub async fn run(&self, request: PublishRequest, cancel: CancellationToken) -> PublishResult {
        let run_id = Uuid::new_v4().to_string();
        let mut state = RunState::new(run_id.clone());
        let outcome = self.execute(&run_id, &request, &mut state, &cancel).await;
        let result = state.finish(outcome);

        if result.success {
            info!(
                run_id = %result.run_id,
                asset_id = result.asset_id.as_deref().unwrap_or(""),
                verification = ?result.verification,
                "✓ publish complete"
            );
        }
        result
    }

    #[instrument(name = "publish", skip(self, request, state, cancel), fields(source = %request.source.raw))]
    async fn execute(
        &self,
        run_id: &str,
        request: &PublishRequest,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = &request.source;

        state.enter(PipelineStage::Resolving, cancel)?;
        let resolved = SourceResolver::new(self.config.resolver.clone()).resolve(source)?;
        state.note(format!(
            "resolved {} ({}) to {} candidate(s)",
            resolved.canonical_id,
            resolved.provider,
            resolved.candidates.len()
        ));

        let workspace = RunWorkspace::create(&self.config.storage, &self.budget, run_id)?;

        state.enter(PipelineStage::Probing, cancel)?;
        let triage = ProbeExecutor::new(self.http.clone(), self.config.probe.clone())
            .triage(resolved.candidates, cancel)
            .await?;
        state.attempts.extend(triage.attempts);
        state.note(format!(
            "{} candidate(s) usable, {} rejected by probe",
            triage.usable.len(),
            state.attempts.len()
        ));

        state.enter(PipelineStage::Acquiring, cancel)?;
        let raw = self
            .downloader()
            .acquire(&triage.usable, source.size_hint, &workspace, &mut state.attempts, cancel)
            .await?;
        state.strategy_used = Some(raw.produced_by().to_string());
        state.note(format!("acquired {} bytes via {}", raw.size(), raw.produced_by()));

        state.enter(PipelineStage::Transcoding, cancel)?;
        let prepared = TranscodeEngine::new(
            self.runner.clone(),
            self.config.transcode.clone(),
            self.config.tools.clone(),
        )
        .prepare(raw, source.size_hint, source.duration_hint, &workspace, cancel)
        .await?;
        let asset = prepared.asset;
        state.size_bytes = Some(asset.size());
        state.profile_used = prepared.profile.clone();
        match &prepared.profile {
            Some(profile) => state.note(format!("transcoded with profile {} to {} bytes", profile, asset.size())),
            None => state.note("passthrough, no transcode needed"),
        }

        state.enter(PipelineStage::Uploading, cancel)?;
        let client = GraphClient::new(self.http.clone(), request.destination.access_token.clone());
        let receipt = UploadSessionManager::new(client.clone(), self.config.upload.clone())
            .upload(&asset, &request.destination.container_id, &request.metadata, cancel)
            .await?;
        drop(asset);
        state.asset_id = Some(receipt.asset_id.clone());
        state.note(match receipt.mode {
            UploadMode::Direct => format!("direct upload, asset {}", receipt.asset_id),
            UploadMode::Chunked => format!("{} chunk(s) uploaded, asset {}", receipt.chunks, receipt.asset_id),
        });

        state.enter(PipelineStage::Verifying, cancel)?;
        let report = PublishVerifier::new(client, self.config.verify.clone())
            .verify(
                &request.destination.container_id,
                &receipt.asset_id,
                request.metadata.verification_marker(),
                cancel,
            )
            .await?;
        state.verification = report.status;
        match report.status {
            VerificationStatus::Unconfirmed => {
                let inconclusive = PipelineError::VerificationInconclusive { polls: report.polls };
                state.diagnostics.push(Diagnostic::error(
                    PipelineStage::Verifying,
                    ErrorKind::VerificationInconclusive,
                    inconclusive.to_string(),
                    inconclusive.hint(),
                ));
            }
            VerificationStatus::Fallback => {
                warn!(post_id = report.post_id.as_deref().unwrap_or(""), "post stored as a link card");
                state.note("post was stored as a link card, not as native video");
            }
            VerificationStatus::ConfirmedVideo => {
                state.note(format!("confirmed as video after {} poll(s)", report.polls))
            }
            VerificationStatus::Skipped => state.note("verification disabled"),
        }

        state.enter(PipelineStage::Done, cancel)?;
        Ok(())
    }
}
