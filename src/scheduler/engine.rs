//! Slicing engine port and the external-process implementation.

use async_trait::async_trait;
use fleet_shared::QueueEntryId;
use fleet_shared::config::SlicerConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;

use super::ProgressReporter;

#[derive(Debug, Error)]
pub enum SlicingEngineError {
    #[error("slicing failed: {0}")]
    Failed(String),
    #[error("slicing cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation shared between the scheduler and one engine run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    set: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// What the engine is asked to slice. `attempt` identifies the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceJob {
    pub entry_id: QueueEntryId,
    pub attempt: u32,
    pub model_ref: String,
    pub slicing_property_ref: String,
}

pub struct SliceContext {
    pub cancel: CancelFlag,
    pub progress: ProgressReporter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicingOutput {
    pub result_ref: String,
}

#[async_trait]
pub trait SlicingEngine: Send + Sync {
    /// Runs one slicing job. Implementations should poll `ctx.cancel` and
    /// return [`SlicingEngineError::Cancelled`] promptly once it is set.
    async fn slice(
        &self,
        job: SliceJob,
        ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError>;
}

/// Runs an external slicer program per job.
///
/// Arguments may contain `{model}`, `{profile}` and `{output}`; the output
/// path is `<output_dir>/<entry id>-<attempt>.gcode`. Lines the program
/// prints to stdout that end in `%` are read as progress.
#[derive(Debug, Clone)]
pub struct ProcessSlicingEngine {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl ProcessSlicingEngine {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            output_dir: output_dir.into(),
        }
    }

    /// `None` when no program is configured.
    pub fn from_config(config: &SlicerConfig) -> Option<Self> {
        let program = config.program.as_ref()?;
        Some(Self::new(program.clone(), config.args.clone(), config.output_dir.clone()))
    }

    fn output_path(&self, job: &SliceJob) -> PathBuf {
        self.output_dir.join(format!("{}-{}.gcode", job.entry_id, job.attempt))
    }

    fn render_args(&self, job: &SliceJob, output: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &job.model_ref)
                    .replace("{profile}", &job.slicing_property_ref)
                    .replace("{output}", output)
            })
            .collect()
    }
}

/// Stand-in used when no slicer program is configured; every run fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSlicingEngine;

#[async_trait]
impl SlicingEngine for UnconfiguredSlicingEngine {
    async fn slice(
        &self,
        _job: SliceJob,
        _ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError> {
        Err(SlicingEngineError::Failed("no slicer program configured".to_string()))
    }
}

fn parse_progress(line: &str) -> Option<u8> {
    let value = line.trim().strip_suffix('%')?;
    let value = value.rsplit(|c: char| c.is_whitespace()).next()?;
    let pct: f64 = value.parse().ok()?;
    Some(pct.clamp(0.0, 100.0) as u8)
}

#[async_trait]
impl SlicingEngine for ProcessSlicingEngine {
    async fn slice(
        &self,
        job: SliceJob,
        ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError> {
        if ctx.cancel.is_cancelled() {
            return Err(SlicingEngineError::Cancelled);
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = self.output_path(&job);
        let output_str = output.display().to_string();
        let args = self.render_args(&job, &output_str);
        tracing::info!(
            entry = %job.entry_id,
            attempt = job.attempt,
            program = %self.program,
            "starting slicer"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let progress = ctx.progress.clone();
        let progress_task = tokio::spawn(async move {
            let Some(stdout) = stdout else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(pct) = parse_progress(&line) {
                    progress.report(pct).await;
                }
            }
        });
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancel.cancelled() => {
                tracing::info!(entry = %job.entry_id, "cancelling slicer process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(entry = %job.entry_id, "failed to kill slicer: {}", e);
                }
                progress_task.abort();
                stderr_task.abort();
                return Err(SlicingEngineError::Cancelled);
            }
        };
        let _ = progress_task.await;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr_text.lines().last().unwrap_or("").trim().to_string();
            return Err(SlicingEngineError::Failed(if detail.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                format!("{} exited with {}: {}", self.program, status, detail)
            }));
        }
        tracing::info!(entry = %job.entry_id, output = %output_str, "slicer finished");
        Ok(SlicingOutput { result_ref: output_str })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn job() -> SliceJob {
        SliceJob {
            entry_id: QueueEntryId::new(),
            attempt: 0,
            model_ref: "benchy.stl".into(),
            slicing_property_ref: "pla-0.2".into(),
        }
    }

    fn ctx() -> SliceContext {
        SliceContext {
            cancel: CancelFlag::default(),
            progress: ProgressReporter::detached(),
        }
    }

    #[test]
    fn progress_lines_are_parsed() {
        assert_eq!(parse_progress("42%"), Some(42));
        assert_eq!(parse_progress("layer 3 done 57.5%"), Some(57));
        assert_eq!(parse_progress("250%"), Some(100));
        assert_eq!(parse_progress("loading model"), None);
    }

    #[test]
    fn placeholders_are_substituted() {
        let engine = ProcessSlicingEngine::new(
            "slicer",
            vec!["--load".into(), "{profile}".into(), "{model}".into(), "-o={output}".into()],
            "out",
        );
        let args = engine.render_args(&job(), "out/x.gcode");
        assert_eq!(args, vec!["--load", "pla-0.2", "benchy.stl", "-o=out/x.gcode"]);
    }

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = CancelFlag::default();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(flag.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_engine_writes_output() {
        let dir = tempdir().unwrap();
        let engine = ProcessSlicingEngine::new(
            "sh",
            vec!["-c".into(), "echo 50%; echo G28 > \"$0\"".into(), "{output}".into()],
            dir.path(),
        );
        let output = engine.slice(job(), ctx()).await.unwrap();
        let written = std::fs::read_to_string(&output.result_ref).unwrap();
        assert_eq!(written.trim(), "G28");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_engine_reports_failure() {
        let dir = tempdir().unwrap();
        let engine = ProcessSlicingEngine::new(
            "sh",
            vec!["-c".into(), "echo 'bad profile' >&2; exit 3".into()],
            dir.path(),
        );
        let err = engine.slice(job(), ctx()).await.unwrap_err();
        assert!(matches!(err, SlicingEngineError::Failed(ref msg) if msg.contains("bad profile")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_engine_is_killed_on_cancel() {
        let dir = tempdir().unwrap();
        let engine = ProcessSlicingEngine::new("sleep", vec!["30".into()], dir.path());
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        let run = tokio::spawn(async move { engine.slice(job(), ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(matches!(result, Err(SlicingEngineError::Cancelled)));
    }
}
