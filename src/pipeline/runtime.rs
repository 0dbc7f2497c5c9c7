use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn path_arg(self, value: &Path) -> Self {
        self.arg(value.to_string_lossy().to_string())
    }

    /// Human readable rendering for logs. Never fed back into a shell.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(char::is_whitespace) {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.status_code == 0
    }
}

#[async_trait]
pub trait PipelineCommandRunner: Send + Sync + 'static {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError>;
}

#[async_trait]
impl<T> PipelineCommandRunner for Arc<T>
where
    T: PipelineCommandRunner + ?Sized,
{
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError> {
        (**self).run(spec).await
    }
}

#[derive(Debug, Default, Clone)]
pub struct TokioPipelineCommandRunner;

#[async_trait]
impl PipelineCommandRunner for TokioPipelineCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError> {
        debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning external command");
        let output = Command::new(spec.program.as_str())
            .args(spec.args.iter().map(String::as_str))
            .current_dir(spec.cwd.as_path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| PipelineRuntimeError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).to_string(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineRuntimeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn default_app_root_from_manifest_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}
