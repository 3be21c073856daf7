use tonic::Status;
use uuid::Uuid;

use crate::core::{
    domain::{self, Job, JobId, JobState, OwnerId},
    service::ServiceError,
};
use crate::grpc::models::{self, Empty, chrono_to_prost, job_status};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
    #[error("Invalid job id: {0}")]
    InvalidJobId(String),
}

impl From<ConversionError> for Status {
    fn from(err: ConversionError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

pub fn parse_job_id(raw: &str) -> Result<JobId, ConversionError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ConversionError::InvalidJobId(raw.to_string()))
}

pub fn parse_owner(raw: &str) -> Result<OwnerId, ConversionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConversionError::MissingField {
            field: "owner_id".to_string(),
        });
    }
    Ok(OwnerId(raw.to_string()))
}

impl TryFrom<models::JobRef> for (OwnerId, JobId) {
    type Error = ConversionError;

    fn try_from(req: models::JobRef) -> Result<Self, ConversionError> {
        Ok((parse_owner(&req.owner_id)?, parse_job_id(&req.job_id)?))
    }
}

impl From<domain::FailureKind> for models::FailureKind {
    fn from(kind: domain::FailureKind) -> Self {
        match kind {
            domain::FailureKind::UserInputError => models::FailureKind::UserInputError,
            domain::FailureKind::GeneratorCrash => models::FailureKind::GeneratorCrash,
            domain::FailureKind::Timeout => models::FailureKind::Timeout,
            domain::FailureKind::Cancelled => models::FailureKind::Cancelled,
            domain::FailureKind::SpawnFailure => models::FailureKind::SpawnFailure,
            domain::FailureKind::Internal => models::FailureKind::Internal,
        }
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl From<&JobState> for job_status::State {
    fn from(state: &JobState) -> Self {
        match state {
            JobState::Queued => job_status::State::Queued(Empty {}),
            JobState::Running => job_status::State::Running(Empty {}),
            JobState::Succeeded { artifact, patches } => {
                job_status::State::Succeeded(models::Succeeded {
                    artifact_name: file_name(artifact),
                    patch_names: patches.iter().map(|p| file_name(p)).collect(),
                })
            }
            JobState::Failed { reason } => job_status::State::Failed(models::Failed {
                kind: models::FailureKind::from(reason.kind).into(),
                message: reason.message.clone(),
                diagnostics_name: reason.diagnostics.as_deref().map(file_name).unwrap_or_default(),
            }),
        }
    }
}

impl From<&Job> for models::JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            owner_id: job.owner.to_string(),
            attempts: job.attempts,
            created_at: Some(chrono_to_prost(job.created_at)),
            started_at: job.started_at.map(chrono_to_prost),
            finished_at: job.finished_at.map(chrono_to_prost),
            state: Some((&job.state).into()),
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::NotFound(_) | ServiceError::FileNotFound(_) => Status::not_found(message),
            ServiceError::Forbidden(_) => Status::permission_denied(message),
            ServiceError::InvalidUpload(_) => Status::invalid_argument(message),
            ServiceError::NotReady(_) => Status::failed_precondition(message),
            ServiceError::Halted(_) => Status::unavailable(message),
            ServiceError::Workspace(_) | ServiceError::Store(_) | ServiceError::Io(_) => {
                tracing::error!(error = %message, "Internal error while serving request");
                Status::internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tonic::Code;

    use super::*;
    use crate::core::{
        domain::FailureReason,
        store::StoreError,
        traits::generator::SpawnError,
    };

    #[test]
    fn test_job_status_for_succeeded_job() {
        let id = Uuid::new_v4();
        let mut job = Job::new(id, "alice".into(), PathBuf::from("/u/Alice.yaml"));
        job.attempts = 2;
        job.started_at = Some(job.created_at);
        let job = job.change_state(JobState::Succeeded {
            artifact: PathBuf::from(format!("/p/{id}/{id}.zip")),
            patches: vec![PathBuf::from(format!("/p/{id}/{id}_P1_Alice.aplttp"))],
        });

        let status = models::JobStatus::from(&job);

        assert_eq!(status.job_id, id.to_string());
        assert_eq!(status.owner_id, "alice");
        assert_eq!(status.attempts, 2);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());
        assert_eq!(
            status.state,
            Some(job_status::State::Succeeded(models::Succeeded {
                artifact_name: format!("{id}.zip"),
                patch_names: vec![format!("{id}_P1_Alice.aplttp")],
            }))
        );
    }

    #[test]
    fn test_job_status_for_failed_job() {
        let job = Job::new(Uuid::new_v4(), "alice".into(), PathBuf::from("in.yaml")).change_state(
            JobState::Failed {
                reason: FailureReason {
                    kind: domain::FailureKind::UserInputError,
                    message: "Please fix your yaml.".to_string(),
                    diagnostics: Some(PathBuf::from("/p/42/diagnostics.log")),
                },
            },
        );

        let status = models::JobStatus::from(&job);

        let Some(job_status::State::Failed(failed)) = &status.state else {
            panic!("Expected failed state, got {:?}", status.state);
        };
        assert_eq!(failed.kind(), models::FailureKind::UserInputError);
        assert_eq!(failed.message, "Please fix your yaml.");
        assert_eq!(failed.diagnostics_name, "diagnostics.log");
    }

    #[test]
    fn test_parse_job_ref() {
        let id = Uuid::new_v4();
        let parsed: (OwnerId, JobId) = models::JobRef {
            job_id: id.to_string(),
            owner_id: " alice ".to_string(),
        }
        .try_into()
        .unwrap();
        assert_eq!(parsed, (OwnerId::from("alice"), id));

        let missing_owner: Result<(OwnerId, JobId), _> = models::JobRef {
            job_id: id.to_string(),
            owner_id: String::new(),
        }
        .try_into();
        assert!(matches!(missing_owner, Err(ConversionError::MissingField { .. })));

        assert!(matches!(
            parse_job_id("not-a-uuid"),
            Err(ConversionError::InvalidJobId(_))
        ));
    }

    #[test]
    fn test_service_errors_to_status() {
        let id = Uuid::new_v4();
        let cases = [
            (ServiceError::NotFound(id), Code::NotFound),
            (ServiceError::FileNotFound("x".to_string()), Code::NotFound),
            (ServiceError::Forbidden("bob".into()), Code::PermissionDenied),
            (ServiceError::InvalidUpload("empty".to_string()), Code::InvalidArgument),
            (ServiceError::NotReady("running"), Code::FailedPrecondition),
            (
                ServiceError::Halted(SpawnError::new(std::path::Path::new("/gen"), "missing")),
                Code::Unavailable,
            ),
            (
                ServiceError::Store(StoreError::Duplicate(id)),
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }
}
