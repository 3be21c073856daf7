use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        OwnerId(value.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerId,
    pub input: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub state: JobState,
}

impl Job {
    pub fn new(id: JobId, owner: OwnerId, input: PathBuf) -> Self {
        Self {
            id,
            owner,
            input,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            state: JobState::default(),
        }
    }

    pub fn change_state(&self, new_state: JobState) -> Self {
        Self {
            state: new_state,
            ..self.clone()
        }
    }

    /// Main artifact in the patches area. Present only once the job succeeded.
    #[cfg(test)]
    pub fn artifact(&self) -> Option<&Path> {
        match &self.state {
            JobState::Succeeded { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            JobState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Succeeded {
        artifact: PathBuf,
        patches: Vec<PathBuf>,
    },
    Failed {
        reason: FailureReason,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { .. } => "failed",
        }
    }

    /// Queued -> Running -> {Succeeded, Failed}, plus Queued -> Failed for
    /// cancellation before dispatch.
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Failed { .. }) => true,
            (JobState::Running, JobState::Succeeded { .. }) => true,
            (JobState::Running, JobState::Failed { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
    pub diagnostics: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    UserInputError,
    GeneratorCrash,
    Timeout,
    Cancelled,
    SpawnFailure,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::UserInputError => "user input error",
            FailureKind::GeneratorCrash => "generator crash",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::SpawnFailure => "spawn failure",
            FailureKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Per-job filesystem namespace. Every path a job touches lives below one of
/// these three directories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub job_id: JobId,
    pub upload_dir: PathBuf,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Workspace {
    pub fn artifact_path(&self, extension: &str) -> PathBuf {
        if extension.is_empty() {
            self.output_dir.join(self.job_id.to_string())
        } else {
            self.output_dir.join(format!("{}.{}", self.job_id, extension))
        }
    }

    pub fn patch_path(&self, entry_name: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{}", self.job_id, entry_name))
    }

    pub fn diagnostics_path(&self) -> PathBuf {
        self.output_dir.join(crate::constants::DIAGNOSTICS_FILE_NAME)
    }
}

#[derive(Clone, Debug)]
pub struct GenerationLimits {
    pub timeout: Duration,
    pub memory_bytes: Option<u64>,
    pub cpu_time_secs: Option<u64>,
    pub max_output_bytes: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            memory_bytes: None,
            cpu_time_secs: None,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Success,
    UserInputError,
    GeneratorCrash,
    Timeout,
    Cancelled,
}

impl Classification {
    pub fn failure_kind(self) -> Option<FailureKind> {
        match self {
            Classification::Success => None,
            Classification::UserInputError => Some(FailureKind::UserInputError),
            Classification::GeneratorCrash => Some(FailureKind::GeneratorCrash),
            Classification::Timeout => Some(FailureKind::Timeout),
            Classification::Cancelled => Some(FailureKind::Cancelled),
        }
    }
}

/// Outcome of one generator invocation attempt.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    classification: Classification,
    artifact: Option<PathBuf>,
}

impl GenerationResult {
    pub fn success(
        artifact: PathBuf,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            elapsed,
            classification: Classification::Success,
            artifact: Some(artifact),
        }
    }

    /// Any non-success outcome. Passing `Classification::Success` here is a
    /// contract violation and is downgraded to `GeneratorCrash`.
    pub fn failure(
        classification: Classification,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> Self {
        let classification = match classification {
            Classification::Success => Classification::GeneratorCrash,
            other => other,
        };
        Self {
            exit_code,
            stdout,
            stderr,
            elapsed,
            classification,
            artifact: None,
        }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }
}
