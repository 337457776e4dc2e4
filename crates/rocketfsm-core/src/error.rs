//! Error taxonomy shared by the validator, the pipeline and the bundle assembler.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by RocketFSM operations.
///
/// Every variant carries enough context (path, value, index, command line)
/// for the caller to act without re-running anything.
#[derive(Error, Debug)]
pub enum FsmError {
    /// Conflicting or missing required inputs to a command.
    #[error("usage error: {0}")]
    Usage(String),

    /// Malformed or structurally insufficient policy document.
    #[error("policy format error{}: {reason}", display_path(.path))]
    PolicyFormat {
        path: Option<PathBuf>,
        reason: String,
    },

    /// Sideband byte length is not a whole number of 32-bit words.
    #[error("malformed sideband stream: length {len} is not a multiple of 4")]
    MalformedStream { len: usize },

    /// A sideband word has no state mapped to it in the policy `ids` table.
    #[error("unknown tag id {value} (0x{value:08x}) at word index {index}")]
    UnknownTagId { value: u32, index: usize },

    /// The validator produced a FAIL outcome.
    #[error("policy violation: {}", .violations.join("; "))]
    PolicyViolation {
        violations: Vec<String>,
        trace: Vec<String>,
    },

    /// An external tool could not be started or exited non-zero.
    #[error("tool invocation failed: `{command}` ({})", display_status(.exit_code))]
    ToolInvocation {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Filesystem read, write or copy failure.
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

fn display_status(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit status {c}"),
        None => "could not be started".to_string(),
    }
}

/// Discriminant of [`FsmError`], used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UsageError,
    PolicyFormatError,
    MalformedStreamError,
    UnknownTagIdError,
    PolicyViolation,
    ToolInvocationError,
    IOError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UsageError => "UsageError",
            ErrorKind::PolicyFormatError => "PolicyFormatError",
            ErrorKind::MalformedStreamError => "MalformedStreamError",
            ErrorKind::UnknownTagIdError => "UnknownTagIdError",
            ErrorKind::PolicyViolation => "PolicyViolation",
            ErrorKind::ToolInvocationError => "ToolInvocationError",
            ErrorKind::IOError => "IOError",
        }
    }

    /// Process exit code for this kind of failure.
    ///
    /// `1` is reserved for policy violations and `2` for input or format
    /// problems. Toolchain failures use `3`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::PolicyViolation => 1,
            ErrorKind::ToolInvocationError => 3,
            ErrorKind::UsageError
            | ErrorKind::PolicyFormatError
            | ErrorKind::MalformedStreamError
            | ErrorKind::UnknownTagIdError
            | ErrorKind::IOError => 2,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FsmError {
    /// Build an [`FsmError::Io`] bound to the path that failed.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsmError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn policy_format(path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        FsmError::PolicyFormat {
            path,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FsmError::Usage(_) => ErrorKind::UsageError,
            FsmError::PolicyFormat { .. } => ErrorKind::PolicyFormatError,
            FsmError::MalformedStream { .. } => ErrorKind::MalformedStreamError,
            FsmError::UnknownTagId { .. } => ErrorKind::UnknownTagIdError,
            FsmError::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            FsmError::ToolInvocation { .. } => ErrorKind::ToolInvocationError,
            FsmError::Io { .. } => ErrorKind::IOError,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

/// Result type for RocketFSM operations
pub type Result<T> = std::result::Result<T, FsmError>;
