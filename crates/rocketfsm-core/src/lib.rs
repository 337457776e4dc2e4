//! RocketFSM - FSM tag-sequence validation for tagged RISC-V payloads
//!
//! Provides:
//! - Policy loading and path resolution (`policy`)
//! - Tag extraction from assembly markers or the `.fsm_trace` sideband (`extract`)
//! - Pass/fail validation with a full violation report (`validate`)
//! - A staged build pipeline gated on validation (`pipeline`)
//! - Content-hashed deployment bundles (`bundle`)

pub mod bundle;
pub mod config;
pub mod digest;
pub mod error;
pub mod extract;
pub mod fakes;
pub mod pipeline;
pub mod policy;
pub mod runner;
pub mod sideband;
pub mod stage;
pub mod telemetry;
pub mod toolchain;
pub mod validate;

// Re-export key types
pub use bundle::{assemble_bundle, ArchiveOutcome, BundleManifest, BundleOutput};
pub use config::{BuildConfig, BuildOptions, TagMode};
pub use digest::ContentHash;
pub use error::{ErrorKind, FsmError, Result};
pub use extract::{extract_from_sideband, extract_from_text, TagInput, TagSequence};
pub use pipeline::{Pipeline, PipelineFailure, PipelineRun};
pub use policy::{load_resolved_policy, resolve_policy_path, Policy, PolicySource};
pub use runner::{SystemToolRunner, Tool, ToolInvocation, ToolOutput, ToolRunner};
pub use stage::{Stage, StagePlan, StageState};
pub use telemetry::init_tracing;
pub use validate::{validate, Outcome, ValidationResult, Violation};

/// Extract the tag sequence from `input` and validate it.
///
/// A FAIL outcome is returned as a value; `Err` is reserved for input and
/// format problems (missing file, malformed stream, unknown tag ID).
pub fn check(input: &TagInput, policy: &Policy) -> Result<ValidationResult> {
    let sequence = input.extract(policy)?;
    Ok(validate(&sequence, policy))
}

/// RocketFSM version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
