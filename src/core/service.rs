use std::{io, path::PathBuf, sync::Arc};

use tokio::fs;
use uuid::Uuid;

use crate::constants::DIAGNOSTICS_FILE_NAME;
use crate::core::{
    domain::{Job, JobId, JobState, OwnerId},
    publisher::PublishError,
    scheduler::{ScheduleError, Scheduler},
    store::{JobStore, StoreError},
    traits::generator::SpawnError,
    workspace::{WorkspaceError, WorkspaceManager},
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("file {0} not found")]
    FileNotFound(String),
    #[error("owner {0} is not allowed to submit jobs")]
    Forbidden(OwnerId),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("job is {0}, no artifact available")]
    NotReady(&'static str),
    #[error("generation is halted: {0}")]
    Halted(SpawnError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

impl From<ScheduleError> for ServiceError {
    fn from(value: ScheduleError) -> Self {
        match value {
            ScheduleError::Halted(err) => ServiceError::Halted(err),
            ScheduleError::Store(err) | ScheduleError::Publish(PublishError::Store(err)) => err.into(),
            ScheduleError::Publish(PublishError::MissingWorkspace(id)) => {
                ServiceError::Io(io::Error::other(format!("no workspace for job {}", id)))
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadPolicy {
    /// Lowercase, without the leading dot.
    pub extensions: Vec<String>,
    pub max_bytes: usize,
    /// Empty means anyone may submit.
    pub allowed_owners: Vec<OwnerId>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            extensions: vec!["yaml".to_string(), "yml".to_string()],
            max_bytes: 1024 * 1024,
            allowed_owners: Vec::new(),
        }
    }
}

impl UploadPolicy {
    fn check_owner(&self, owner: &OwnerId) -> Result<(), ServiceError> {
        if self.allowed_owners.is_empty() || self.allowed_owners.contains(owner) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(owner.clone()))
        }
    }

    /// Validates the upload and returns the name it is stored under.
    fn check_upload(&self, file_name: &str, content: &[u8]) -> Result<String, ServiceError> {
        // Attachment names may come from any OS; keep only the last segment.
        let name = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        if name.is_empty() || name == "." || name == ".." {
            return Err(ServiceError::InvalidUpload(format!(
                "file name {:?} is not usable",
                file_name
            )));
        }

        let extension = std::path::Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.extensions.contains(&extension) {
            return Err(ServiceError::InvalidUpload(format!(
                "{} is not one of: {}",
                name,
                self.extensions.join(", ")
            )));
        }

        if content.is_empty() {
            return Err(ServiceError::InvalidUpload(format!("{} is empty", name)));
        }
        if content.len() > self.max_bytes {
            return Err(ServiceError::InvalidUpload(format!(
                "{} is {} bytes, limit is {}",
                name,
                content.len(),
                self.max_bytes
            )));
        }

        Ok(name.to_string())
    }
}

/// Intake, status, artifact fetch and cancellation for callers. Every lookup
/// is scoped to the caller: another owner's job is reported as missing.
#[derive(Debug)]
pub struct JobService {
    policy: UploadPolicy,
    store: Arc<JobStore>,
    workspaces: Arc<WorkspaceManager>,
    scheduler: Arc<Scheduler>,
}

impl JobService {
    pub fn new(
        policy: UploadPolicy,
        store: Arc<JobStore>,
        workspaces: Arc<WorkspaceManager>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            policy,
            store,
            workspaces,
            scheduler,
        }
    }

    /// Stages the upload in a fresh workspace and queues it. Returns as soon
    /// as the job is queued.
    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    pub async fn submit(
        &self,
        owner: OwnerId,
        file_name: &str,
        content: &[u8],
    ) -> Result<Job, ServiceError> {
        self.policy.check_owner(&owner)?;
        let name = self.policy.check_upload(file_name, content)?;
        if let Some(err) = self.scheduler.halted() {
            return Err(ServiceError::Halted(err));
        }

        let id = Uuid::new_v4();
        let workspace = self.workspaces.allocate(id).await?;
        let input = workspace.upload_dir.join(&name);

        let staged = match fs::write(&input, content).await {
            Ok(()) => {
                let job = Job::new(id, owner, input);
                self.scheduler
                    .enqueue(job.clone())
                    .map(|_| job)
                    .map_err(ServiceError::from)
            }
            Err(e) => Err(e.into()),
        };
        if staged.is_err() {
            if let Err(e) = self.workspaces.purge(&id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to purge rejected workspace");
            }
        }
        staged
    }

    pub async fn status(&self, owner: &OwnerId, id: &JobId) -> Result<Job, ServiceError> {
        let job = self.store.get(id).await.ok_or(ServiceError::NotFound(*id))?;
        if job.owner != *owner {
            return Err(ServiceError::NotFound(*id));
        }
        Ok(job)
    }

    /// Opens the main artifact, or one extracted patch file when `file_name`
    /// is given (with or without the job id prefix). A failed job serves its
    /// diagnostics log under `DIAGNOSTICS_FILE_NAME`.
    pub async fn open_artifact(
        &self,
        owner: &OwnerId,
        id: &JobId,
        file_name: Option<&str>,
    ) -> Result<(String, fs::File), ServiceError> {
        let job = self.status(owner, id).await?;

        let path: PathBuf = match (&job.state, file_name) {
            (JobState::Succeeded { artifact, .. }, None) => artifact.clone(),
            (JobState::Succeeded { patches, .. }, Some(wanted)) => {
                let prefixed = format!("{}_{}", id, wanted);
                patches
                    .iter()
                    .find(|patch| {
                        patch
                            .file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n == wanted || n == prefixed)
                    })
                    .cloned()
                    .ok_or_else(|| ServiceError::FileNotFound(wanted.to_string()))?
            }
            (JobState::Failed { reason }, Some(DIAGNOSTICS_FILE_NAME)) => reason
                .diagnostics
                .clone()
                .ok_or_else(|| ServiceError::FileNotFound(DIAGNOSTICS_FILE_NAME.to_string()))?,
            (JobState::Failed { .. }, Some(wanted)) => {
                return Err(ServiceError::FileNotFound(wanted.to_string()));
            }
            (state, _) => return Err(ServiceError::NotReady(state.name())),
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            // Purged by retention between the lookup and the open.
            io::ErrorKind::NotFound => ServiceError::NotFound(*id),
            _ => ServiceError::Io(e),
        })?;
        Ok((name, file))
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, owner: &OwnerId, id: &JobId) -> Result<Job, ServiceError> {
        self.status(owner, id).await?;
        self.scheduler.cancel(id).await?;
        self.status(owner, id).await
    }
}
