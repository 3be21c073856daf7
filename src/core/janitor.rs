use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::core::{store::JobStore, workspace::WorkspaceManager};

#[derive(Clone, Debug)]
pub struct JanitorConfig {
    /// How long a finished job and its published files are kept.
    pub retention: Duration,
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            interval: Duration::from_secs(3600),
        }
    }
}

/// Periodically forgets terminal jobs past their retention window and
/// deletes whatever they still hold on disk.
#[derive(Debug)]
pub struct Janitor {
    config: JanitorConfig,
    store: Arc<JobStore>,
    workspaces: Arc<WorkspaceManager>,
}

impl Janitor {
    pub fn new(config: JanitorConfig, store: Arc<JobStore>, workspaces: Arc<WorkspaceManager>) -> Self {
        Self {
            config,
            store,
            workspaces,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Janitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Janitor stopped");
    }

    /// Purges expired jobs and returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let retention = TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let mut purged = 0;
        let mut errors = 0;
        for job in self.store.list().await {
            let expired = job.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff);
            if !expired {
                continue;
            }

            match self.workspaces.purge(&job.id).await {
                Ok(()) => {
                    self.store.remove(&job.id);
                    purged += 1;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to purge expired job");
                    errors += 1;
                }
            }
        }

        if purged > 0 || errors > 0 {
            tracing::info!(purged, errors, "Retention sweep completed");
        } else {
            tracing::debug!("Retention sweep completed, nothing expired");
        }
        purged
    }
}
