use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{
    Semaphore,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::QUEUE_TX_ERR,
    core::{
        domain::{
            Classification, FailureKind, GenerationLimits, GenerationResult, Job, JobId, JobState,
        },
        publisher::{PublishError, Publisher},
        store::{JobStore, StoreError},
        traits::generator::{Generator, SpawnError},
        workspace::WorkspaceManager,
    },
};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker slots, i.e. generator processes allowed to run at once.
    pub workers: usize,
    /// Automatic re-runs after a `Timeout` before it becomes terminal.
    pub timeout_retries: u32,
    pub limits: GenerationLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout_retries: 1,
            limits: GenerationLimits::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("generation is halted: {0}")]
    Halted(SpawnError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// State shared by the dispatcher and every job task.
#[derive(Debug)]
struct Context {
    config: SchedulerConfig,
    generator: Arc<dyn Generator>,
    store: Arc<JobStore>,
    workspaces: Arc<WorkspaceManager>,
    publisher: Arc<Publisher>,
    slots: Arc<Semaphore>,
    tokens: DashMap<JobId, CancellationToken>,
    closing: CancellationToken,
    halt_tx: watch::Sender<Option<SpawnError>>,
}

/// FIFO job queue in front of a fixed pool of generator slots.
///
/// One dispatcher task takes job ids in submission order and waits for a free
/// slot before moving each job to Running, so a later job can never overtake
/// an earlier one.
#[derive(Debug)]
pub struct Scheduler {
    ctx: Arc<Context>,
    queue_tx: UnboundedSender<JobId>,
    halt_rx: watch::Receiver<Option<SpawnError>>,
}

impl Scheduler {
    /// Spawns the dispatcher; must be called inside a tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        generator: Arc<dyn Generator>,
        store: Arc<JobStore>,
        workspaces: Arc<WorkspaceManager>,
        publisher: Arc<Publisher>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (halt_tx, halt_rx) = watch::channel(None);

        let ctx = Arc::new(Context {
            config,
            generator,
            store,
            workspaces,
            publisher,
            slots: Arc::new(Semaphore::new(workers)),
            tokens: DashMap::new(),
            closing: CancellationToken::new(),
            halt_tx,
        });
        handle_dispatching(ctx.clone(), queue_rx);
        tracing::info!(workers, "Scheduler started");

        Self {
            ctx,
            queue_tx,
            halt_rx,
        }
    }

    /// Records the job as Queued and hands it to the dispatcher. Never waits
    /// for a slot.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, owner = %job.owner))]
    pub fn enqueue(&self, job: Job) -> Result<JobId, ScheduleError> {
        if let Some(err) = self.halted() {
            return Err(ScheduleError::Halted(err));
        }

        let id = job.id;
        self.ctx.tokens.insert(id, self.ctx.closing.child_token());
        if let Err(e) = self.ctx.store.insert(job) {
            self.ctx.tokens.remove(&id);
            return Err(e.into());
        }
        self.queue_tx.send(id).expect(QUEUE_TX_ERR);

        tracing::info!("Job queued");
        Ok(id)
    }

    /// A queued job fails with "cancelled" on the spot. A running job has its
    /// generator terminated and resolves to the same reason shortly after,
    /// even if the generator had already exited. Returns false once the job
    /// is finished or its result is being published.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: &JobId) -> Result<bool, ScheduleError> {
        self.ctx
            .store
            .get(id)
            .await
            .ok_or(StoreError::NotFound(*id))?;

        if self.ctx.publisher.cancel_queued(id).await?.is_some() {
            self.ctx.cleanup(id).await;
            return Ok(true);
        }

        match self.ctx.tokens.get(id) {
            Some(token) => {
                tracing::info!("Cancelling running job");
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn halted(&self) -> Option<SpawnError> {
        self.halt_rx.borrow().clone()
    }

    /// Receiver that flips to `Some` once the generator could not be started.
    pub fn subscribe_halt(&self) -> watch::Receiver<Option<SpawnError>> {
        self.halt_rx.clone()
    }

    /// Cancels every queued and running job and waits until all slots are
    /// free again.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Scheduler shutting down");
        self.ctx.closing.cancel();

        let workers = self.ctx.config.workers.max(1) as u32;
        match tokio::time::timeout(grace, self.ctx.slots.acquire_many(workers)).await {
            Ok(_) => tracing::info!("All jobs stopped"),
            Err(_) => tracing::warn!("Jobs still running after shutdown grace period"),
        }
    }
}

impl Context {
    fn halted(&self) -> Option<SpawnError> {
        self.halt_tx.borrow().clone()
    }

    fn token(&self, id: &JobId) -> CancellationToken {
        self.tokens
            .get(id)
            .map(|token| token.clone())
            .unwrap_or_else(|| self.closing.child_token())
    }

    async fn cleanup(&self, id: &JobId) {
        self.tokens.remove(id);
        if let Err(e) = self.workspaces.release(id).await {
            tracing::error!(job_id = %id, error = %e, "Failed to release workspace");
        }
    }

    async fn fail_queued(&self, id: &JobId, kind: FailureKind, message: String) {
        let still_queued = self
            .store
            .get(id)
            .await
            .is_some_and(|job| job.state == JobState::Queued);
        if !still_queued {
            self.cleanup(id).await;
            return;
        }

        let result = match kind {
            FailureKind::Cancelled => self.publisher.cancel_queued(id).await.map(|_| ()),
            _ => self.publisher.fail(id, kind, message).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!(job_id = %id, error = %e, "Failed to fail queued job");
        }
        self.cleanup(id).await;
    }

    /// Runs the generator, re-running it after a timeout while retries are
    /// left.
    async fn generate(
        &self,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Option<GenerationResult>, SpawnError> {
        let Some(workspace) = self.workspaces.get(&job.id) else {
            return Ok(None);
        };

        let mut retries_left = self.config.timeout_retries;
        loop {
            if token.is_cancelled() {
                return Ok(Some(GenerationResult::failure(
                    Classification::Cancelled,
                    None,
                    String::new(),
                    String::new(),
                    Duration::ZERO,
                )));
            }

            let result = self
                .generator
                .invoke(
                    &job.input,
                    &workspace.working_dir,
                    &self.config.limits,
                    token.clone(),
                )
                .await?;

            if result.classification() != Classification::Timeout
                || retries_left == 0
                || token.is_cancelled()
            {
                return Ok(Some(result));
            }
            retries_left -= 1;

            let attempt = match self.store.record_attempt(&job.id).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to record retry attempt");
                    return Ok(Some(result));
                }
            };
            if let Err(e) = self.workspaces.reset_working(&job.id).await {
                tracing::error!(error = %e, "Failed to reset working dir for retry");
                return Ok(Some(result));
            }
            tracing::warn!(attempt, "Generation timed out, retrying");
        }
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, owner = %job.owner))]
    async fn run_job(&self, job: Job) {
        let id = job.id;
        let token = self.token(&id);

        let generated = self.generate(&job, &token).await;
        // Cancels that land after this see no token and report false.
        self.tokens.remove(&id);

        let published = match generated {
            Ok(Some(result)) => self.publisher.publish(&id, honour_cancel(result, &token)).await,
            Ok(None) => {
                self.publisher
                    .fail(&id, FailureKind::Internal, "workspace is missing".to_string())
                    .await
            }
            Err(err) => {
                tracing::error!(error = %err, "Generator cannot be started, halting generation");
                self.halt_tx.send_replace(Some(err.clone()));
                self.publisher
                    .fail(&id, FailureKind::SpawnFailure, err.to_string())
                    .await
            }
        };
        if let Err(e) = published {
            tracing::error!(error = %e, "Failed to publish job result");
        }

        self.cleanup(&id).await;
    }
}

/// A cancel accepted while the generator was finishing wins over its result.
fn honour_cancel(result: GenerationResult, token: &CancellationToken) -> GenerationResult {
    if !token.is_cancelled() || result.classification() == Classification::Cancelled {
        return result;
    }
    tracing::info!(classification = ?result.classification(), "Discarding result of cancelled job");
    GenerationResult::failure(
        Classification::Cancelled,
        result.exit_code,
        result.stdout,
        result.stderr,
        result.elapsed,
    )
}

#[tracing::instrument(skip_all)]
fn handle_dispatching(ctx: Arc<Context>, mut queue_rx: UnboundedReceiver<JobId>) {
    tokio::spawn(async move {
        while let Some(id) = queue_rx.recv().await {
            dispatch(&ctx, id).await;
        }
        tracing::debug!("Job queue closed");
    });
}

async fn dispatch(ctx: &Arc<Context>, id: JobId) {
    if let Some((kind, message)) = stop_reason(ctx) {
        ctx.fail_queued(&id, kind, message).await;
        return;
    }

    let Ok(permit) = ctx.slots.clone().acquire_owned().await else {
        tracing::error!("Worker slots closed");
        return;
    };

    // The halt may have tripped while this job waited for its slot.
    if let Some((kind, message)) = stop_reason(ctx) {
        ctx.fail_queued(&id, kind, message).await;
        return;
    }

    match ctx.store.start(&id).await {
        Ok(Some(job)) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.run_job(job).await;
                drop(permit);
            });
        }
        Ok(None) => {
            tracing::debug!(job_id = %id, "Skipping job that left the queue");
            ctx.cleanup(&id).await;
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Failed to start job");
            ctx.cleanup(&id).await;
        }
    }
}

fn stop_reason(ctx: &Context) -> Option<(FailureKind, String)> {
    if let Some(err) = ctx.halted() {
        return Some((FailureKind::SpawnFailure, err.to_string()));
    }
    if ctx.closing.is_cancelled() {
        return Some((FailureKind::Cancelled, String::new()));
    }
    None
}
