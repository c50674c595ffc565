// Relay pipeline: resolve, probe, acquire, transcode, upload, verify

pub mod backends;
pub mod config;
pub mod destination;
pub mod diagnostics;
pub mod downloader;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod resolver;
pub mod retry;
pub mod storage;
pub mod tools;
pub mod traits;
pub mod transcode;

pub use config::PipelineConfig;
pub use errors::{ErrorKind, PipelineError, Result};
pub use models::{
    AcquisitionAttempt, AttemptOutcome, Candidate, DestinationTarget, Diagnostic, MediaSourceReference,
    PipelineStage, PostMetadata, ProviderKind, PublishRequest, PublishResult, StrategyKind,
    VerificationStatus, Visibility,
};
pub use orchestrator::PipelineOrchestrator;
pub use resolver::{ResolvedSource, SourceResolver};
pub use storage::{DiskBudget, RunWorkspace};
pub use tools::{ProcessToolRunner, ToolInvocation, ToolOutput, ToolRunner};
pub use traits::AcquisitionBackend;
