//! Disk quota enforcement
//!
//! Usage is recomputed from the filesystem on every check; nothing is
//! persisted, so the numbers cannot drift from reality.
//!
//! Two measurements are available. [`VolumeUsage`] reports the used space of
//! the whole volume holding the staging root, which counts bytes that have
//! nothing to do with staging. [`DirectoryUsage`] sums the files under the
//! staging root only.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::{QuotaConfig, QuotaScope};
use crate::error::{Result, StageError};

/// Source of the current disk usage figure
pub trait DiskUsage: Send + Sync {
    /// Bytes currently in use. Blocking; callers run it off the async runtime.
    fn used_bytes(&self) -> io::Result<u64>;
}

/// Used space on the volume containing `path` (total minus free)
#[derive(Debug, Clone)]
pub struct VolumeUsage {
    path: PathBuf,
}

impl VolumeUsage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskUsage for VolumeUsage {
    fn used_bytes(&self) -> io::Result<u64> {
        let total = fs2::total_space(&self.path)?;
        let free = fs2::free_space(&self.path)?;
        Ok(total.saturating_sub(free))
    }
}

/// Sum of regular file sizes below `root`
#[derive(Debug, Clone)]
pub struct DirectoryUsage {
    root: PathBuf,
}

impl DirectoryUsage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DiskUsage for DirectoryUsage {
    fn used_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;

        // Files and directories may be reclaimed while we walk; a missing
        // root measures as empty.
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if vanished(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            if entry.file_type().is_file() {
                match entry.metadata() {
                    Ok(metadata) => total += metadata.len(),
                    Err(e) if vanished(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(total)
    }
}

fn vanished(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

/// Verdict of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Ok { used: u64, ceiling: u64 },
    Exceeded { used: u64, ceiling: u64 },
}

impl QuotaStatus {
    fn evaluate(used: u64, ceiling: u64) -> Self {
        if used >= ceiling {
            QuotaStatus::Exceeded { used, ceiling }
        } else {
            QuotaStatus::Ok { used, ceiling }
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, QuotaStatus::Exceeded { .. })
    }

    /// Convert an exceeded verdict into [`StageError::QuotaExceeded`].
    pub fn into_result(self) -> Result<()> {
        match self {
            QuotaStatus::Ok { .. } => Ok(()),
            QuotaStatus::Exceeded { used, ceiling } => {
                Err(StageError::QuotaExceeded { used, ceiling })
            }
        }
    }
}

/// Compares measured usage against a fixed ceiling.
#[derive(Clone)]
pub struct QuotaGuard {
    usage: Arc<dyn DiskUsage>,
    ceiling: u64,
}

impl QuotaGuard {
    pub fn new(usage: Arc<dyn DiskUsage>, ceiling: u64) -> Self {
        Self { usage, ceiling }
    }

    /// Build the guard for `staging_root` using the configured scope.
    pub fn from_config(config: &QuotaConfig, staging_root: &Path) -> Self {
        let usage: Arc<dyn DiskUsage> = match config.scope {
            QuotaScope::Volume => Arc::new(VolumeUsage::new(staging_root)),
            QuotaScope::Directory => Arc::new(DirectoryUsage::new(staging_root)),
        };
        Self::new(usage, config.ceiling_bytes)
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub async fn used_bytes(&self) -> Result<u64> {
        let usage = Arc::clone(&self.usage);
        tokio::task::spawn_blocking(move || usage.used_bytes())
            .await
            .map_err(|e| StageError::PersistFailed(format!("Disk usage task failed: {e}")))?
            .map_err(|e| StageError::PersistFailed(format!("Failed to measure disk usage: {e}")))
    }

    /// Exceeded when usage is at or above the ceiling.
    pub async fn check_quota(&self) -> Result<QuotaStatus> {
        let used = self.used_bytes().await?;
        let status = QuotaStatus::evaluate(used, self.ceiling);
        if status.is_exceeded() {
            tracing::warn!("Quota exceeded: {} of {} bytes used", used, self.ceiling);
        } else {
            tracing::debug!("Quota ok: {} of {} bytes used", used, self.ceiling);
        }
        Ok(status)
    }

    /// Check whether `incoming` more bytes would still fit under the ceiling.
    pub async fn preflight(&self, incoming: u64) -> Result<QuotaStatus> {
        let used = self.used_bytes().await?;
        let status = QuotaStatus::evaluate(used.saturating_add(incoming), self.ceiling);
        if status.is_exceeded() {
            tracing::warn!(
                "Refusing {} incoming bytes: {} of {} bytes already used",
                incoming,
                used,
                self.ceiling
            );
        }
        Ok(status)
    }
}
