use std::{
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;

use crate::{
    constants::CANCELLED_MSG,
    core::{
        classify::user_facing_output,
        domain::{FailureKind, FailureReason, GenerationResult, Job, JobId, JobState, Workspace},
        patches::extract_patch_files,
        store::{JobStore, StoreError},
        workspace::WorkspaceManager,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no workspace allocated for job {0}")]
    MissingWorkspace(JobId),
}

/// Places generator results and writes the terminal state of each job.
/// Nothing else sets a job's artifact or failure reason.
#[derive(Debug)]
pub struct Publisher {
    store: Arc<JobStore>,
    workspaces: Arc<WorkspaceManager>,
    markers: Vec<String>,
    extract_patches: bool,
}

impl Publisher {
    pub fn new(
        store: Arc<JobStore>,
        workspaces: Arc<WorkspaceManager>,
        markers: Vec<String>,
        extract_patches: bool,
    ) -> Self {
        Self {
            store,
            workspaces,
            markers,
            extract_patches,
        }
    }

    #[tracing::instrument(skip(self, result), fields(classification = ?result.classification()))]
    pub async fn publish(&self, job_id: &JobId, result: GenerationResult) -> Result<Job, PublishError> {
        let workspace = self
            .workspaces
            .get(job_id)
            .ok_or(PublishError::MissingWorkspace(*job_id))?;

        let state = match result.artifact() {
            Some(artifact) => match self.place_artifact(&workspace, artifact).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to move artifact into patches area");
                    let message = format!("failed to publish artifact: {}", e);
                    self.failed_state(&workspace, FailureKind::Internal, message, Some(&result))
                        .await
                }
            },
            None => {
                let kind = result
                    .classification()
                    .failure_kind()
                    .unwrap_or(FailureKind::GeneratorCrash);
                let message = self.failure_message(kind, &result);
                self.failed_state(&workspace, kind, message, Some(&result))
                    .await
            }
        };

        let job = self.store.finish(job_id, state).await?;
        log_outcome(&job);
        Ok(job)
    }

    /// Fails a job without a generator result (spawn failure, internal error).
    pub async fn fail(
        &self,
        job_id: &JobId,
        kind: FailureKind,
        message: String,
    ) -> Result<Job, PublishError> {
        let state = match self.workspaces.get(job_id) {
            Some(workspace) => self.failed_state(&workspace, kind, message, None).await,
            None => JobState::Failed {
                reason: FailureReason {
                    kind,
                    message,
                    diagnostics: None,
                },
            },
        };
        let job = self.store.finish(job_id, state).await?;
        log_outcome(&job);
        Ok(job)
    }

    /// Cancels a job that has not been dispatched yet. Returns `None` if the
    /// job already left the queue.
    pub async fn cancel_queued(&self, job_id: &JobId) -> Result<Option<Job>, PublishError> {
        let state = JobState::Failed {
            reason: FailureReason {
                kind: FailureKind::Cancelled,
                message: CANCELLED_MSG.to_string(),
                diagnostics: None,
            },
        };
        let job = self
            .store
            .finish_if(job_id, state, |current| *current == JobState::Queued)
            .await?;
        if let Some(job) = &job {
            log_outcome(job);
        }
        Ok(job)
    }

    async fn place_artifact(&self, workspace: &Workspace, artifact: &Path) -> io::Result<JobState> {
        let extension = artifact
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string();
        let dest = workspace.artifact_path(&extension);
        move_file(artifact, &dest).await?;
        self.workspaces.retain_output(&workspace.job_id);

        let patches = if self.extract_patches && extension.eq_ignore_ascii_case("zip") {
            self.unpack_patches(workspace, &dest).await
        } else {
            Vec::new()
        };

        Ok(JobState::Succeeded {
            artifact: dest,
            patches,
        })
    }

    async fn unpack_patches(&self, workspace: &Workspace, archive: &Path) -> Vec<PathBuf> {
        let workspace = workspace.clone();
        let archive = archive.to_path_buf();
        match tokio::task::spawn_blocking(move || extract_patch_files(&archive, &workspace)).await
        {
            Ok(Ok(patches)) => patches,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Patch extraction failed, publishing artifact only");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Patch extraction task panicked");
                Vec::new()
            }
        }
    }

    async fn failed_state(
        &self,
        workspace: &Workspace,
        kind: FailureKind,
        message: String,
        result: Option<&GenerationResult>,
    ) -> JobState {
        let path = workspace.diagnostics_path();
        let diagnostics = match fs::write(&path, render_diagnostics(kind, &message, result)).await
        {
            Ok(()) => {
                self.workspaces.retain_output(&workspace.job_id);
                Some(path)
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to write diagnostics");
                None
            }
        };

        JobState::Failed {
            reason: FailureReason {
                kind,
                message,
                diagnostics,
            },
        }
    }

    fn failure_message(&self, kind: FailureKind, result: &GenerationResult) -> String {
        match kind {
            FailureKind::UserInputError => {
                user_facing_output(&result.stdout, &result.stderr, &self.markers).to_string()
            }
            FailureKind::Timeout => format!(
                "generation timed out after {} s",
                result.elapsed.as_secs()
            ),
            FailureKind::Cancelled => CANCELLED_MSG.to_string(),
            _ => match result.exit_code {
                Some(0) => "generator exited without producing an artifact".to_string(),
                Some(code) => format!("generator failed with exit code {}", code),
                None => "generator was terminated by a signal".to_string(),
            },
        }
    }
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Roots on different filesystems.
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

fn render_diagnostics(
    kind: FailureKind,
    message: &str,
    result: Option<&GenerationResult>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "classification: {}", kind);
    let _ = writeln!(out, "message: {}", message.trim_end());
    if let Some(result) = result {
        let exit_code = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let _ = writeln!(out, "exit code: {}", exit_code);
        let _ = writeln!(out, "elapsed: {} ms", result.elapsed.as_millis());
        let _ = writeln!(out, "--- stdout ---\n{}", result.stdout);
        let _ = writeln!(out, "--- stderr ---\n{}", result.stderr);
    }
    out
}

fn log_outcome(job: &Job) {
    match &job.state {
        JobState::Succeeded { artifact, patches } => tracing::info!(
            job_id = %job.id,
            owner = %job.owner,
            attempts = job.attempts,
            artifact = %artifact.display(),
            patches = patches.len(),
            "Job succeeded"
        ),
        JobState::Failed { reason } => {
            let diagnostics = reason
                .diagnostics
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            match reason.kind {
                FailureKind::GeneratorCrash | FailureKind::Internal | FailureKind::SpawnFailure => {
                    tracing::error!(
                        job_id = %job.id,
                        kind = %reason.kind,
                        diagnostics = %diagnostics,
                        "Job failed: {}", reason.message
                    )
                }
                _ => tracing::info!(
                    job_id = %job.id,
                    kind = %reason.kind,
                    diagnostics = %diagnostics,
                    "Job failed: {}", reason.message
                ),
            }
        }
        _ => {}
    }
}
