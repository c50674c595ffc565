// Acquisition backend trait definition

use std::path::Path;
use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::errors::Result;
use super::models::{Candidate, StrategyKind};
use super::storage::DiskReservation;

/// What a finished transfer reported about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    /// Bytes written to the destination path
    pub bytes: u64,
    pub content_type: Option<String>,
    /// Length announced by the host, if any
    pub expected_len: Option<u64>,
}

/// Trait for acquisition strategy implementations
#[async_trait]
pub trait AcquisitionBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Whether this backend executes candidates of `kind`
    fn handles(&self, kind: StrategyKind) -> bool;

    /// Transfer `candidate` into `dest`.
    ///
    /// `received` must track bytes written so far; the caller samples it for
    /// stagnation detection. Every byte written must first be covered by
    /// `reservation`. The future may be dropped at any point.
    async fn fetch(
        &self,
        candidate: &Candidate,
        dest: &Path,
        received: &AtomicU64,
        reservation: &mut DiskReservation,
        cancel: &CancellationToken,
    ) -> Result<FetchReport>;
}
