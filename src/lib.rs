pub mod cli;
pub mod pipeline;

pub use pipeline::{PipelineConfig, PipelineOrchestrator, PublishRequest, PublishResult};
