use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        resource::{Resource, setrlimit},
        signal::{Signal, killpg},
    },
    unistd::Pid,
};
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::core::{
    classify::classify,
    domain::{Classification, GenerationLimits, GenerationResult},
    traits::generator::{Generator, SpawnError},
};

/// How long to wait for output pipes to close after the process is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs the generator binary as a child process in its own process group.
#[derive(Clone, Debug)]
pub struct NativeGenerator {
    executable: PathBuf,
    args: Vec<String>,
    artifact_extension: String,
    markers: Vec<String>,
}

enum Ending {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl NativeGenerator {
    /// `args` may contain `{input}`, `{input_dir}` and `{working_dir}`
    /// placeholders, substituted per invocation.
    pub fn new<T>(executable: T, args: Vec<String>, artifact_extension: &str, markers: Vec<String>) -> Self
    where
        T: AsRef<Path>,
    {
        NativeGenerator {
            executable: executable.as_ref().into(),
            args,
            artifact_extension: artifact_extension.trim_start_matches('.').to_string(),
            markers,
        }
    }

    fn render_args(&self, input: &Path, working_dir: &Path) -> Vec<String> {
        let input_dir = input.parent().unwrap_or_else(|| Path::new("."));
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input_dir}", &input_dir.to_string_lossy())
                    .replace("{input}", &input.to_string_lossy())
                    .replace("{working_dir}", &working_dir.to_string_lossy())
            })
            .collect()
    }

    async fn find_artifact(&self, working_dir: &Path) -> Option<PathBuf> {
        let mut entries = fs::read_dir(working_dir).await.ok()?;
        let mut found = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.artifact_extension));
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if matches && is_file {
                found.push(path);
            }
        }
        found.sort();
        found.into_iter().next()
    }
}

#[async_trait::async_trait]
impl Generator for NativeGenerator {
    #[tracing::instrument(skip(self, limits, cancel))]
    async fn invoke(
        &self,
        input: &Path,
        working_dir: &Path,
        limits: &GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, SpawnError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(self.render_args(input, working_dir))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let memory_bytes = limits.memory_bytes;
        let cpu_time_secs = limits.cpu_time_secs;
        if memory_bytes.is_some() || cpu_time_secs.is_some() {
            // SAFETY: the closure only calls setrlimit, which is
            // async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_rlimits(memory_bytes, cpu_time_secs));
            }
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::new(&self.executable, e))?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        tracing::debug!(pid = ?pgid, "Generator started");

        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), limits.max_output_bytes));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), limits.max_output_bytes));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(limits.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        // Leftover descendants die with the group whatever the ending was.
        if let Some(pgid) = pgid {
            kill_group(pgid);
        }
        let status = match ending {
            Ending::Exited(status) => Some(status),
            Ending::TimedOut | Ending::Cancelled => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        let elapsed = start.elapsed();

        let stdout = collect_output(stdout_task).await;
        let stderr = collect_output(stderr_task).await;

        let result = match status {
            None if cancel.is_cancelled() => GenerationResult::failure(
                Classification::Cancelled,
                None,
                stdout,
                stderr,
                elapsed,
            ),
            None => {
                tracing::warn!(timeout_secs = limits.timeout.as_secs(), "Generator timed out");
                GenerationResult::failure(Classification::Timeout, None, stdout, stderr, elapsed)
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to wait for generator");
                let stderr = format!("{}\nfailed to wait for generator: {}", stderr, e);
                GenerationResult::failure(
                    Classification::GeneratorCrash,
                    None,
                    stdout,
                    stderr,
                    elapsed,
                )
            }
            Some(Ok(status)) => {
                let exit_code = status.code();
                let artifact = if exit_code == Some(0) {
                    self.find_artifact(working_dir).await
                } else {
                    None
                };
                let classification =
                    classify(exit_code, &stdout, &stderr, artifact.as_deref(), &self.markers);
                match (classification, artifact) {
                    (Classification::Success, Some(artifact)) => {
                        GenerationResult::success(artifact, exit_code, stdout, stderr, elapsed)
                    }
                    (classification, _) => GenerationResult::failure(
                        classification,
                        exit_code,
                        stdout,
                        stderr,
                        elapsed,
                    ),
                }
            }
        };

        tracing::debug!(
            classification = ?result.classification(),
            exit_code = ?result.exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "Generator finished"
        );
        Ok(result)
    }
}

fn apply_rlimits(memory_bytes: Option<u64>, cpu_time_secs: Option<u64>) -> io::Result<()> {
    if let Some(bytes) = memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)?;
    }
    if let Some(secs) = cpu_time_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(io::Error::from)?;
    }
    Ok(())
}

fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
    }
}

/// Drains a pipe to EOF, keeping at most `cap` bytes. Reading past the cap
/// keeps the child from blocking on a full pipe.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept.truncate(char_boundary(&kept));
    String::from_utf8_lossy(&kept).into_owned()
}

/// Length of `bytes` without a trailing character the cap cut in half.
fn char_boundary(bytes: &[u8]) -> usize {
    let lead = bytes
        .iter()
        .rposition(|b| b & 0xC0 != 0x80)
        .filter(|&i| bytes.len() - i <= 4);
    match lead {
        Some(i) => match std::str::from_utf8(&bytes[i..]) {
            Err(e) if e.error_len().is_none() => i,
            _ => bytes.len(),
        },
        None => bytes.len(),
    }
}

async fn collect_output(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            tracing::warn!("Output pipe still open after generator exit, dropping it");
            abort.abort();
            String::new()
        }
    }
}
