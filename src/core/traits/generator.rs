use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::core::domain::{GenerationLimits, GenerationResult};

/// Single entry point to the external generator.
///
/// Every outcome of a started process (success, rejected input, crash,
/// timeout, cancellation) is encoded in the returned `GenerationResult`. Only
/// a failure to start the process at all is an `Err`.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Generator: std::fmt::Debug + Send + Sync {
    async fn invoke(
        &self,
        input: &Path,
        working_dir: &Path,
        limits: &GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, SpawnError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to spawn generator {}: {msg}", executable.display())]
pub struct SpawnError {
    pub executable: PathBuf,
    pub msg: String,
}

impl SpawnError {
    pub fn new(executable: &Path, err: impl std::fmt::Display) -> Self {
        Self {
            executable: executable.to_path_buf(),
            msg: err.to_string(),
        }
    }
}
