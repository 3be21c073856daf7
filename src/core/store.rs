use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use itertools::Itertools;
use tokio::sync::Mutex;

use crate::core::domain::{Job, JobId, JobState};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: &'static str,
        to: &'static str,
    },
    #[error("job {0} already exists")]
    Duplicate(JobId),
}

/// In-memory job table.
///
/// Each record sits behind its own lock, so transitions of one job are
/// serialized while different jobs never contend with each other.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<JobId, Arc<Mutex<Job>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Result<(), StoreError> {
        let id = job.id;
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(id)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(job)));
                Ok(())
            }
        }
    }

    fn record(&self, id: &JobId) -> Result<Arc<Mutex<Job>>, StoreError> {
        self.jobs
            .get(id)
            .map(|record| record.clone())
            .ok_or(StoreError::NotFound(*id))
    }

    pub async fn get(&self, id: &JobId) -> Option<Job> {
        let record = self.record(id).ok()?;
        let job = record.lock().await;
        Some(job.clone())
    }

    /// Snapshot of every job, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let records: Vec<_> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            jobs.push(record.lock().await.clone());
        }
        jobs.into_iter()
            .sorted_by_key(|job| job.created_at)
            .collect()
    }

    /// Queued -> Running. Returns `None` when the job is no longer queued,
    /// e.g. because it was cancelled while waiting for a slot.
    pub async fn start(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let record = self.record(id)?;
        let mut job = record.lock().await;
        if job.state != JobState::Queued {
            return Ok(None);
        }

        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        job.attempts = 1;
        tracing::debug!(job_id = %id, "Job started");
        Ok(Some(job.clone()))
    }

    /// Counts one more generator attempt for a running job.
    pub async fn record_attempt(&self, id: &JobId) -> Result<u32, StoreError> {
        let record = self.record(id)?;
        let mut job = record.lock().await;
        if job.state != JobState::Running {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: job.state.name(),
                to: JobState::Running.name(),
            });
        }
        job.attempts += 1;
        Ok(job.attempts)
    }

    /// Moves a job into a terminal state. Only the result publisher calls
    /// this, which keeps it the single writer of completion fields.
    pub(crate) async fn finish(&self, id: &JobId, state: JobState) -> Result<Job, StoreError> {
        self.finish_if(id, state, |_| true)
            .await?
            .ok_or(StoreError::NotFound(*id))
    }

    /// Like `finish`, but only when `guard` accepts the current state.
    /// Returns `None` if the guard refused.
    pub(crate) async fn finish_if<F>(
        &self,
        id: &JobId,
        state: JobState,
        guard: F,
    ) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(&JobState) -> bool,
    {
        let record = self.record(id)?;
        let mut job = record.lock().await;
        if !guard(&job.state) {
            return Ok(None);
        }
        if !state.is_terminal() || !job.state.can_transition_to(&state) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: job.state.name(),
                to: state.name(),
            });
        }

        job.state = state;
        job.finished_at = Some(Utc::now());
        tracing::debug!(job_id = %id, state = job.state.name(), "Job finished");
        Ok(Some(job.clone()))
    }

    pub fn remove(&self, id: &JobId) -> bool {
        self.jobs.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;
    use crate::core::domain::{FailureKind, FailureReason};

    fn queued_job() -> Job {
        Job::new(Uuid::new_v4(), "owner".into(), PathBuf::from("in.yaml"))
    }

    fn failed(kind: FailureKind) -> JobState {
        JobState::Failed {
            reason: FailureReason {
                kind,
                message: kind.to_string(),
                diagnostics: None,
            },
        }
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = JobStore::new();
        let job = queued_job();

        store.insert(job.clone()).unwrap();
        assert!(matches!(
            store.insert(job.clone()),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.get(&job.id).await.unwrap().id, job.id);
        assert_eq!(store.list().await.len(), 1);

        assert!(store.remove(&job.id));
        assert!(store.get(&job.id).await.is_none());
    }

    #[tokio::test]
    async fn test_start_only_from_queued() {
        let store = JobStore::new();
        let job = queued_job();
        store.insert(job.clone()).unwrap();

        let started = store.start(&job.id).await.unwrap().unwrap();
        assert_eq!(started.state, JobState::Running);
        assert_eq!(started.attempts, 1);
        assert!(started.started_at.is_some());

        assert!(store.start(&job.id).await.unwrap().is_none());
        assert!(matches!(
            store.start(&Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_attempt() {
        let store = JobStore::new();
        let job = queued_job();
        store.insert(job.clone()).unwrap();

        assert!(store.record_attempt(&job.id).await.is_err());
        store.start(&job.id).await.unwrap();
        assert_eq!(store.record_attempt(&job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_finish_sets_terminal_state_once() {
        let store = JobStore::new();
        let job = queued_job();
        store.insert(job.clone()).unwrap();
        store.start(&job.id).await.unwrap();

        let done = store
            .finish(
                &job.id,
                JobState::Succeeded {
                    artifact: PathBuf::from("out.zip"),
                    patches: vec![],
                },
            )
            .await
            .unwrap();
        assert!(done.finished_at.is_some());

        let again = store.finish(&job.id, failed(FailureKind::Timeout)).await;
        assert!(matches!(
            again,
            Err(StoreError::InvalidTransition {
                from: "succeeded",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_finish_rejects_non_terminal_target() {
        let store = JobStore::new();
        let job = queued_job();
        store.insert(job.clone()).unwrap();

        let result = store.finish(&job.id, JobState::Running).await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_finish_if_respects_guard() {
        let store = JobStore::new();
        let job = queued_job();
        store.insert(job.clone()).unwrap();
        store.start(&job.id).await.unwrap();

        let refused = store
            .finish_if(&job.id, failed(FailureKind::Cancelled), |state| {
                *state == JobState::Queued
            })
            .await
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(store.get(&job.id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_single_winner() {
        let store = Arc::new(JobStore::new());
        let job = queued_job();
        store.insert(job.clone()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = job.id;
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        store.start(&id).await.unwrap().is_some()
                    } else {
                        store
                            .finish_if(&id, failed(FailureKind::Cancelled), |s| {
                                *s == JobState::Queued
                            })
                            .await
                            .unwrap()
                            .is_some()
                    }
                })
            })
            .collect();

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let store = JobStore::new();
        let first = queued_job();
        let mut second = queued_job();
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        store.insert(second.clone()).unwrap();
        store.insert(first.clone()).unwrap();

        let ids: Vec<_> = store.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
