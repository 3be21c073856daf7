use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{Classification, GenerationLimits, GenerationResult},
    patches::tests::write_archive,
    traits::generator::{Generator, SpawnError},
};

#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Writes a zip with one patch entry into the working dir.
    Success,
    UserInputError(String),
    Crash,
    Timeout,
}

/// Observes how many invocations overlap and in which order they began.
#[derive(Debug, Default)]
pub struct Probe {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<PathBuf>>,
}

impl Probe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Inputs in the order their invocations started.
    pub fn started(&self) -> Vec<PathBuf> {
        self.started.lock().unwrap().clone()
    }

    fn enter(&self, input: &Path) {
        self.started.lock().unwrap().push(input.to_path_buf());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct GeneratorStub {
    outcomes: Vec<StubOutcome>,
    delay: Duration,
    calls: AtomicUsize,
    probe: Arc<Probe>,
}

impl GeneratorStub {
    /// The n-th call gets the n-th outcome; the last one repeats.
    pub fn new(outcomes: Vec<StubOutcome>, delay: Duration) -> Self {
        assert!(!outcomes.is_empty());
        Self {
            outcomes,
            delay,
            calls: AtomicUsize::new(0),
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn probe(&self) -> Arc<Probe> {
        self.probe.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Generator for GeneratorStub {
    #[tracing::instrument(skip(self, limits, cancel))]
    async fn invoke(
        &self,
        input: &Path,
        working_dir: &Path,
        limits: &GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, SpawnError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes[call.min(self.outcomes.len() - 1)].clone();
        tracing::debug!("Stub invocation {}: {:?}", call, outcome);

        self.probe.enter(input);
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.probe.leave();

        let elapsed = self.delay;
        if cancelled {
            return Ok(GenerationResult::failure(
                Classification::Cancelled,
                None,
                String::new(),
                String::new(),
                elapsed,
            ));
        }

        let result = match outcome {
            StubOutcome::Success => {
                let artifact = working_dir.join(format!("AP_{}.zip", call));
                write_archive(
                    &artifact,
                    &[("AP.archipelago", b"multidata"), ("P1_Alice.aplttp", b"patch")],
                );
                GenerationResult::success(
                    artifact,
                    Some(0),
                    "Done.\n".to_string(),
                    String::new(),
                    elapsed,
                )
            }
            StubOutcome::UserInputError(msg) => GenerationResult::failure(
                Classification::UserInputError,
                Some(1),
                String::new(),
                msg,
                elapsed,
            ),
            StubOutcome::Crash => GenerationResult::failure(
                Classification::GeneratorCrash,
                Some(1),
                String::new(),
                "Traceback (most recent call last):\n".to_string(),
                elapsed,
            ),
            StubOutcome::Timeout => GenerationResult::failure(
                Classification::Timeout,
                None,
                String::new(),
                String::new(),
                limits.timeout,
            ),
        };
        Ok(result)
    }
}
