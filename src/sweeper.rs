#![forbid(unsafe_code)]

//! Age based cleanup of the artifact directories.
//!
//! Every tick walks each root once and deletes regular files whose last
//! modification is older than the retention window. It is not a cache: there
//! is no size bound and no protection for files that are being downloaded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub interval: Duration,
    pub max_age: Duration,
}

/// Outcome of one sweep across all roots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub failed: usize,
    pub aborted_roots: Vec<PathBuf>,
}

/// Deletes a single expired file.
#[async_trait]
pub trait FileRemover: Send + Sync {
    async fn remove(&self, path: &Path) -> std::io::Result<()>;
}

pub struct FsRemover;

#[async_trait]
impl FileRemover for FsRemover {
    async fn remove(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

pub struct RetentionSweeper {
    roots: Vec<PathBuf>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    remover: Arc<dyn FileRemover>,
}

impl RetentionSweeper {
    pub fn new(roots: Vec<PathBuf>, policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            roots,
            policy,
            clock,
            remover: Arc::new(FsRemover),
        }
    }

    pub fn with_remover(mut self, remover: Arc<dyn FileRemover>) -> Self {
        self.remover = remover;
        self
    }

    /// Runs a single tick over every root. A failing root is logged and
    /// skipped until the next tick; the others are still swept.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        for root in &self.roots {
            if let Err(err) = self.sweep_root(root, now, &mut report).await {
                warn!(root = %root.display(), error = ?err, "sweep aborted for this tick");
                report.aborted_roots.push(root.clone());
            }
        }
        info!(
            removed = report.removed.len(),
            kept = report.kept,
            failed = report.failed,
            aborted = report.aborted_roots.len(),
            "retention sweep finished"
        );
        report
    }

    async fn sweep_root(
        &self,
        root: &Path,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let mut entries = tokio::fs::read_dir(root)
            .await
            .with_context(|| format!("reading {}", root.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", root.display()))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata
                .modified()
                .with_context(|| format!("mtime of {}", path.display()))?
                .into();

            if !self.is_expired(modified, now) {
                report.kept += 1;
                continue;
            }
            match self.remover.remove(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed expired artifact");
                    report.removed.push(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not remove expired artifact");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn is_expired(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(self.policy.max_age) else {
            return false;
        };
        now.signed_duration_since(modified) > max_age
    }

    /// Starts the periodic sweep. The first tick happens one full interval
    /// after the call, not immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.policy.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = period.as_secs(),
                max_age_secs = self.policy.max_age.as_secs(),
                "retention sweeper started"
            );
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
