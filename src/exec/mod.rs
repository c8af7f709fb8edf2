// pgstash/src/exec/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use which::which;

/// Where a child's standard error goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// Forwarded to this process's stderr.
    Inherit,
    /// Captured alongside stdout.
    #[default]
    Capture,
}

/// A command to run: program, arguments, injected environment and working directory.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<PathBuf>,
    pub stderr: StderrMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    pub fn with_dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }
}

/// Result of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by captured stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }

    pub fn status_display(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Subprocess capability used by the pipeline.
///
/// `run` only fails when the process could not be started or awaited; a
/// non-zero exit is reported through [`CommandOutput::code`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn look_path(&self, binary: &str) -> Result<PathBuf>;

    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Executor backed by the real `PATH` and `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    fn look_path(&self, binary: &str) -> Result<PathBuf> {
        which(binary).with_context(|| format!("cannot resolve {}", binary))
    }

    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        command.stderr(match cmd.stderr {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Capture => Stdio::piped(),
        });
        if let Some(dir) = &cmd.dir {
            command.current_dir(dir);
        }

        tracing::trace!(program = %cmd.program, args = ?cmd.args, "Running command");
        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", cmd.program))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
