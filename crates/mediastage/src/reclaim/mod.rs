//! Timed reclamation of stale staging files
//!
//! The reclaimer idles until its interval elapses, sweeps the staging root,
//! and goes back to idling. A sweep deletes every regular file whose
//! modification time is older than `now - retention`.
//!
//! It shares the directory with in-flight ingestions and takes no lock on
//! it. Files that vanish between listing and deletion count as already
//! reclaimed. No error ever stops the loop: per-file failures are logged and
//! skipped, and a failed listing waits for the next tick.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ReclaimConfig;

/// Shortest interval the timer accepts; `tokio::time::interval` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Reclaimer-local I/O failures; logged, never propagated to ingestion
#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("Failed to list staging directory {path}: {source}")]
    List { path: PathBuf, source: io::Error },

    #[error("Failed to stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("Failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimReport {
    /// Regular files examined
    pub scanned: usize,
    /// Files deleted by this sweep
    pub removed: usize,
    /// Expired files that were already gone when deleted
    pub vanished: usize,
    /// Files that could not be examined or deleted
    pub failed: usize,
}

/// Deletes staging files older than the retention window.
#[derive(Debug, Clone)]
pub struct Reclaimer {
    root: PathBuf,
    interval: Duration,
    retention: Duration,
}

impl Reclaimer {
    /// An interval below [`MIN_SWEEP_INTERVAL`] is raised to it.
    pub fn new(root: impl Into<PathBuf>, interval: Duration, retention: Duration) -> Self {
        Self {
            root: root.into(),
            interval: interval.max(MIN_SWEEP_INTERVAL),
            retention,
        }
    }

    pub fn from_config(config: &ReclaimConfig, root: &Path) -> Self {
        Self::new(root, config.interval(), config.retention())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Delete every file under the root last modified before `now - retention`.
    ///
    /// Only a failure to list the directory is returned; per-file problems
    /// are logged and counted in the report.
    pub async fn sweep(&self, now: SystemTime) -> Result<ReclaimReport, ReclaimError> {
        self.sweep_with(now, |_| {}).await
    }

    /// `sweep`, calling `before_remove` on each expired file just before
    /// deleting it.
    async fn sweep_with<F>(
        &self,
        now: SystemTime,
        before_remove: F,
    ) -> Result<ReclaimReport, ReclaimError>
    where
        F: Fn(&Path),
    {
        let mut report = ReclaimReport::default();
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return Ok(report);
        };

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| ReclaimError::List {
                path: self.root.clone(),
                source,
            })?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(ReclaimError::List {
                        path: self.root.clone(),
                        source,
                    });
                }
            };
            let path = entry.path();

            let modified = match entry.metadata().await {
                Ok(metadata) if !metadata.is_file() => continue,
                Ok(metadata) => metadata.modified(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => Err(e),
            };
            report.scanned += 1;

            let modified = match modified {
                Ok(modified) => modified,
                Err(source) => {
                    warn!("{}", ReclaimError::Stat { path, source });
                    report.failed += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            before_remove(&path);

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Reclaimed {}", path.display());
                    report.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.vanished += 1;
                }
                Err(source) => {
                    warn!("{}", ReclaimError::Remove { path, source });
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run the timer loop on the current runtime until the handle shuts it
    /// down or is dropped. The first sweep happens one interval after start.
    pub fn spawn(self) -> ReclaimerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        info!(
            "Starting reclaimer for {} (interval {:?}, retention {:?})",
            self.root.display(),
            self.interval,
            self.retention
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Reclaimer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep(SystemTime::now()).await {
                            Ok(report) => info!(
                                "Reclaim sweep: scanned {}, removed {}, vanished {}, failed {}",
                                report.scanned, report.removed, report.vanished, report.failed
                            ),
                            Err(e) => warn!("{e}"),
                        }
                    }
                }
            }
        });

        ReclaimerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Owner of a running reclaimer loop. Dropping it also stops the loop.
#[derive(Debug)]
pub struct ReclaimerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Stop the loop and wait for an in-progress sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Reclaimer task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
