// Scratch storage: per-run workspaces and the shared disk budget
//
// Concurrent runs share one work directory. Each run gets its own
// subdirectory (removed when the run ends, whatever the outcome) and draws
// bytes from a run-level budget nested inside the global one, so a single
// large source cannot starve the others.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::{TempDir, TempPath};
use tracing::debug;

use super::config::StorageConfig;
use super::errors::{PipelineError, Result};

/// Byte budget, optionally nested inside a parent budget
#[derive(Debug)]
pub struct DiskBudget {
    limit: u64,
    used: AtomicU64,
    parent: Option<Arc<DiskBudget>>,
}

impl DiskBudget {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicU64::new(0),
            parent: None,
        })
    }

    /// Budget whose reservations also count against `parent`
    pub fn child(parent: &Arc<DiskBudget>, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicU64::new(0),
            parent: Some(Arc::clone(parent)),
        })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available here and in every ancestor
    pub fn available(&self) -> u64 {
        let own = self.limit.saturating_sub(self.used());
        match &self.parent {
            Some(parent) => own.min(parent.available()),
            None => own,
        }
    }

    fn take_local(&self, bytes: u64) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => return false,
            };
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn take(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let available = self.available();
        if !self.take_local(bytes) {
            return Err(PipelineError::DiskExhausted {
                requested: bytes,
                available,
            });
        }
        if let Some(parent) = &self.parent {
            if let Err(e) = parent.take(bytes) {
                self.give_back_local(bytes);
                return Err(e);
            }
        }
        Ok(())
    }

    fn give_back_local(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn give_back(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.give_back_local(bytes);
        if let Some(parent) = &self.parent {
            parent.give_back(bytes);
        }
    }

    /// Reserve `bytes` up front; released when the reservation drops
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<DiskReservation> {
        self.take(bytes)?;
        Ok(DiskReservation {
            budget: Arc::clone(self),
            held: bytes,
        })
    }
}

/// Bytes held against a budget until dropped
#[derive(Debug)]
pub struct DiskReservation {
    budget: Arc<DiskBudget>,
    held: u64,
}

impl DiskReservation {
    pub fn held(&self) -> u64 {
        self.held
    }

    /// Make sure at least `total` bytes are held, taking the difference
    pub fn grow_to(&mut self, total: u64) -> Result<()> {
        if total > self.held {
            self.budget.take(total - self.held)?;
            self.held = total;
        }
        Ok(())
    }

    /// Hold exactly `total` bytes, returning any excess
    pub fn settle(&mut self, total: u64) -> Result<()> {
        if total < self.held {
            self.budget.give_back(self.held - total);
            self.held = total;
            Ok(())
        } else {
            self.grow_to(total)
        }
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        self.budget.give_back(self.held);
    }
}

/// Scratch directory and budget of a single pipeline run
#[derive(Debug)]
pub struct RunWorkspace {
    dir: TempDir,
    budget: Arc<DiskBudget>,
}

impl RunWorkspace {
    pub fn create(config: &StorageConfig, global: &Arc<DiskBudget>, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        let short_id: String = run_id.chars().take(8).collect();
        let dir = tempfile::Builder::new()
            .prefix(&format!("run-{}-", short_id))
            .tempdir_in(&config.work_dir)?;
        debug!(path = %dir.path().display(), "created run workspace");

        Ok(Self {
            dir,
            budget: DiskBudget::child(global, config.max_run_bytes),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh, empty file inside the workspace, deleted when the path drops
    pub fn temp_path(&self, prefix: &str, suffix: &str) -> Result<TempPath> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(self.dir.path())?;
        Ok(file.into_temp_path())
    }

    pub fn reserve(&self, bytes: u64) -> Result<DiskReservation> {
        self.budget.reserve(bytes)
    }

    pub fn budget(&self) -> &Arc<DiskBudget> {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_released_on_drop() {
        let budget = DiskBudget::new(100);
        {
            let _r = budget.reserve(60).unwrap();
            assert_eq!(budget.available(), 40);
            assert!(budget.reserve(50).is_err());
        }
        assert_eq!(budget.available(), 100);
    }

    #[test]
    fn test_child_counts_against_parent() {
        let global = DiskBudget::new(100);
        let run_a = DiskBudget::child(&global, 80);
        let run_b = DiskBudget::child(&global, 80);

        let _a = run_a.reserve(70).unwrap();
        let err = run_b.reserve(40).unwrap_err();
        assert!(matches!(err, PipelineError::DiskExhausted { requested: 40, .. }));
        // failed child reservation must not leak into its own counter
        assert_eq!(run_b.used(), 0);
        assert!(run_b.reserve(30).is_ok());
    }

    #[test]
    fn test_grow_and_settle() {
        let budget = DiskBudget::new(100);
        let mut r = budget.reserve(10).unwrap();
        r.grow_to(50).unwrap();
        assert_eq!(budget.used(), 50);
        assert!(r.grow_to(150).is_err());
        assert_eq!(budget.used(), 50);
        r.settle(20).unwrap();
        assert_eq!(budget.used(), 20);
        drop(r);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            work_dir: root.path().to_path_buf(),
            max_run_bytes: 1024,
            max_total_bytes: 4096,
        };
        let global = DiskBudget::new(config.max_total_bytes);
        let ws = RunWorkspace::create(&config, &global, "abcdef123456").unwrap();
        let file = ws.temp_path("dl-", ".bin").unwrap();
        assert!(file.exists());
        let dir = ws.path().to_path_buf();
        drop(file);
        drop(ws);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
