//! External process execution behind a single capability trait.
//!
//! The pipeline only ever talks to [`ToolRunner`]; production code uses
//! [`SystemToolRunner`] and tests substitute `fakes::ScriptedToolRunner`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{FsmError, Result};

/// External collaborators the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// Cross-compiler producing assembly and object files.
    Compiler,
    /// Binary section extractor (objcopy).
    SectionDump,
    /// Linker, usually the compiler acting as driver.
    Linker,
    /// Archiver over a bundle directory.
    Archiver,
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Compiler => "compiler",
            Tool::SectionDump => "section_dump",
            Tool::Linker => "linker",
            Tool::Archiver => "archiver",
        }
    }
}

/// A fully-built command line plus the files it is expected to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: Tool,

    /// Executable (path or name looked up on `PATH`).
    pub program: PathBuf,

    pub args: Vec<String>,

    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,

    /// Files the tool writes on success.
    pub outputs: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(tool: Tool, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            outputs: Vec::new(),
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Shell-like rendering used in logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Capability to run an external tool to completion.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `invocation` and capture its output.
    ///
    /// Returns `Err` only when the process could not be started; a non-zero
    /// exit is reported through [`ToolOutput::exit_code`].
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Run `invocation` and treat a non-zero exit as [`FsmError::ToolInvocation`].
pub async fn run_checked(runner: &dyn ToolRunner, invocation: &ToolInvocation) -> Result<ToolOutput> {
    debug!(tool = invocation.tool.name(), command = %invocation, "Invoking tool");
    let output = runner.run(invocation).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(FsmError::ToolInvocation {
            command: invocation.command_line(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Runs tools as child processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

#[async_trait]
impl ToolRunner for SystemToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let start = Instant::now();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| FsmError::ToolInvocation {
            command: invocation.command_line(),
            exit_code: None,
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FsmError::ToolInvocation {
                command: invocation.command_line(),
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            })?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
