//! In-memory fake of [`ToolRunner`] (testing only)
//!
//! `ScriptedToolRunner` never spawns a process. It records every invocation
//! and, unless told to fail, writes scripted bytes to each declared output so
//! later stages find the files they expect.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{FsmError, Result};
use crate::runner::{Tool, ToolInvocation, ToolOutput, ToolRunner};

#[derive(Debug, Clone)]
struct ScriptedFailure {
    exit_code: i32,
    stderr: String,
}

/// Scripted stand-in for the real toolchain.
#[derive(Debug, Default)]
pub struct ScriptedToolRunner {
    /// Output file name suffix -> bytes written there.
    files: Vec<(String, Vec<u8>)>,
    failures: HashMap<Tool, ScriptedFailure>,
    unstartable: HashSet<Tool>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `bytes` to any declared output whose file name ends with
    /// `suffix`. The longest matching suffix wins; unmatched outputs are
    /// written empty.
    pub fn with_file(mut self, suffix: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.push((suffix.to_string(), bytes.into()));
        self
    }

    /// Make `tool` exit with `exit_code` and `stderr`, writing nothing.
    pub fn failing(mut self, tool: Tool, exit_code: i32, stderr: &str) -> Self {
        self.failures.insert(
            tool,
            ScriptedFailure {
                exit_code,
                stderr: stderr.to_string(),
            },
        );
        self
    }

    /// Make `tool` fail to start, as if it were missing from `PATH`.
    pub fn unstartable(mut self, tool: Tool) -> Self {
        self.unstartable.insert(tool);
        self
    }

    /// Every invocation received, in order.
    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tools_called(&self) -> Vec<Tool> {
        self.invocations().iter().map(|i| i.tool).collect()
    }

    fn content_for(&self, path: &Path) -> &[u8] {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.files
            .iter()
            .filter(|(suffix, _)| name.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, bytes)| bytes.as_slice())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        if self.unstartable.contains(&invocation.tool) {
            return Err(FsmError::ToolInvocation {
                command: invocation.command_line(),
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{}: not found", invocation.program.display()),
            });
        }

        if let Some(failure) = self.failures.get(&invocation.tool) {
            return Ok(ToolOutput {
                exit_code: Some(failure.exit_code),
                stdout: String::new(),
                stderr: failure.stderr.clone(),
                duration_ms: 0,
            });
        }

        for output in &invocation.outputs {
            let target = match &invocation.cwd {
                Some(dir) if output.is_relative() => dir.join(output),
                _ => output.clone(),
            };
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| FsmError::io(parent, e))?;
            }
            std::fs::write(&target, self.content_for(&target))
                .map_err(|e| FsmError::io(&target, e))?;
        }

        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        })
    }
}
