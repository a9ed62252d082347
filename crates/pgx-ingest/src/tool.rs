//! External tool invocation
//!
//! Thin wrapper around subprocesses. Two modes:
//!
//! - [`ToolRunner::collect`]: run to completion and hand back captured output
//!   (short utilities such as `wc -l`).
//! - [`ToolRunner::stream`]: forward every stdout/stderr line to a callback
//!   while the process runs (annotator, parser).
//!
//! Each invocation resolves exactly once: either with the exit status or with
//! a [`ToolError`]. A launch failure and an exit code never both happen for
//! the same call. Every invocation carries a timeout; on expiry the child's
//! whole process group is killed and the call reports [`ToolError::TimedOut`].
//! Each child leads its own group, so helpers it spawns die with it.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// A single subprocess call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program name for log lines
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// What a finished process left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One line of streamed output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine<'a> {
    Stdout(&'a str),
    Stderr(&'a str),
}

/// Subprocess failures that are not an exit code
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?} and was killed")]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external programs.
///
/// The pipeline only talks to subprocesses through this trait so tests can
/// substitute scripted fakes.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion and capture stdout/stderr
    async fn collect(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError>;

    /// Run to completion, forwarding each output line as it arrives.
    ///
    /// The returned output still carries the full captured streams.
    async fn stream(
        &self,
        invocation: &Invocation,
        on_line: &mut (dyn for<'l> FnMut(OutputLine<'l>) + Send),
    ) -> Result<ToolOutput, ToolError>;
}

/// [`ToolRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(invocation: &Invocation) -> Command {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

/// Kill every process in the group led by `pid`.
///
/// The leader itself is reaped by `kill_on_drop` or an explicit `kill`.
#[cfg(unix)]
async fn kill_process_group(program: &str, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {},
        Ok(status) => warn!(program = %program, pid, %status, "Killing process group failed"),
        Err(e) => warn!(program = %program, pid, error = %e, "Could not run kill"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_program: &str, _pid: Option<u32>) {}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn collect(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        let program = invocation.display_name();
        let child = Self::command(invocation)
            .spawn()
            .map_err(|source| ToolError::Launch {
                program: program.clone(),
                source,
            })?;

        debug!(program = %program, args = ?invocation.args, "Collecting tool output");

        let pid = child.id();
        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ToolOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(ToolError::Io { program, source }),
            Err(_) => {
                warn!(program = %program, timeout = ?invocation.timeout, "Tool timed out");
                kill_process_group(&program, pid).await;
                Err(ToolError::TimedOut {
                    program,
                    timeout: invocation.timeout,
                })
            },
        }
    }

    async fn stream(
        &self,
        invocation: &Invocation,
        on_line: &mut (dyn for<'l> FnMut(OutputLine<'l>) + Send),
    ) -> Result<ToolOutput, ToolError> {
        let program = invocation.display_name();
        let io_error = |source| ToolError::Io {
            program: program.clone(),
            source,
        };

        let mut child = Self::command(invocation)
            .spawn()
            .map_err(|source| ToolError::Launch {
                program: program.clone(),
                source,
            })?;

        debug!(program = %program, args = ?invocation.args, "Streaming tool output");
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stderr was not captured")))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut output = ToolOutput::default();

        let run = async {
            let mut stdout_open = true;
            let mut stderr_open = true;

            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_lines.next_line(), if stdout_open => match line? {
                        Some(line) => {
                            on_line(OutputLine::Stdout(&line));
                            output.stdout.push_str(&line);
                            output.stdout.push('\n');
                        },
                        None => stdout_open = false,
                    },
                    line = stderr_lines.next_line(), if stderr_open => match line? {
                        Some(line) => {
                            on_line(OutputLine::Stderr(&line));
                            output.stderr.push_str(&line);
                            output.stderr.push('\n');
                        },
                        None => stderr_open = false,
                    },
                }
            }

            child.wait().await
        };

        match tokio::time::timeout(invocation.timeout, run).await {
            Ok(Ok(status)) => {
                output.exit_code = status.code();
                Ok(output)
            },
            Ok(Err(source)) => Err(io_error(source)),
            Err(_) => {
                warn!(program = %program, timeout = ?invocation.timeout, "Tool timed out, killing it");
                kill_process_group(&program, pid).await;
                if let Err(e) = child.kill().await {
                    warn!(program = %program, error = %e, "Failed to kill timed out tool");
                }
                Err(ToolError::TimedOut {
                    program,
                    timeout: invocation.timeout,
                })
            },
        }
    }
}
