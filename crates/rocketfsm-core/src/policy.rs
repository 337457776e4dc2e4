//! FSM policy model: start state, accept set, transition adjacency and the
//! optional symbolic-state to numeric-ID table used by the sideband stream.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FsmError, Result};

/// Policy shipped with the crate, identical to `policies/fsm_policy.json`.
pub const BUILTIN_POLICY_JSON: &str = include_str!("../policies/fsm_policy.json");

/// FSM transition policy.
///
/// Loaded once per invocation and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Required first state. `None` disables the start check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// Allowed final states. Empty disables the final-state check.
    #[serde(default)]
    pub accept: BTreeSet<String>,

    /// Outgoing edges per state. A state missing here has no legal successor.
    #[serde(default)]
    pub transitions: BTreeMap<String, BTreeSet<String>>,

    /// Numeric tag IDs, required for sideband validation. Must be injective.
    #[serde(default)]
    pub ids: BTreeMap<String, u32>,

    /// File the document was read from, for error context.
    #[serde(skip)]
    origin: Option<PathBuf>,
}

impl Policy {
    /// Parse a policy document. `origin` is only used for error context.
    pub fn from_json(json: &str, origin: Option<&Path>) -> Result<Self> {
        let mut policy: Policy = serde_json::from_str(json).map_err(|e| {
            FsmError::policy_format(origin.map(Path::to_path_buf), e.to_string())
        })?;
        policy.check_structure(origin)?;
        policy.origin = origin.map(Path::to_path_buf);
        Ok(policy)
    }

    /// Path the policy was loaded from; `None` for the embedded copy.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// No `start`, no `accept` and no `transitions`: every non-empty
    /// sequence is accepted.
    pub fn is_permissive(&self) -> bool {
        self.start.is_none() && self.accept.is_empty() && self.transitions.is_empty()
    }

    /// The embedded default policy.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_POLICY_JSON, None)
    }

    /// Load a policy document from disk.
    ///
    /// Only the shape of the document is checked; unreachable accept states
    /// and similar semantic oddities are not errors.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FsmError::io(path, e))?;
        let policy = Self::from_json(&content, Some(path))?;
        debug!(
            path = %path.display(),
            states = policy.transitions.len(),
            ids = policy.ids.len(),
            "Loaded FSM policy"
        );
        Ok(policy)
    }

    /// Structural checks beyond what deserialization enforces.
    fn check_structure(&self, origin: Option<&Path>) -> Result<()> {
        let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
        for (state, id) in &self.ids {
            if let Some(other) = seen.insert(*id, state) {
                return Err(FsmError::policy_format(
                    origin.map(Path::to_path_buf),
                    format!("duplicate tag id {id} shared by states {other} and {state}"),
                ));
            }
        }
        Ok(())
    }

    /// Allowed successors of `state` (empty when the state has no edges).
    pub fn allowed_next(&self, state: &str) -> impl Iterator<Item = &str> {
        self.transitions
            .get(state)
            .into_iter()
            .flat_map(|next| next.iter().map(String::as_str))
    }

    /// Human-readable list of allowed successors, e.g. `[RUN, HALT]`.
    pub fn describe_allowed(&self, state: &str) -> String {
        format!("[{}]", self.allowed_next(state).collect::<Vec<_>>().join(", "))
    }

    /// Inverse of `ids`: numeric tag ID to symbolic state.
    ///
    /// Fails when the table is absent, since sideband words cannot be
    /// interpreted without it.
    pub fn id_table(&self) -> Result<BTreeMap<u32, &str>> {
        if self.ids.is_empty() {
            return Err(FsmError::policy_format(
                self.origin.clone(),
                "policy has no `ids` table; sideband validation requires one",
            ));
        }
        Ok(self
            .ids
            .iter()
            .map(|(state, id)| (*id, state.as_str()))
            .collect())
    }
}

/// Select the policy file for this invocation.
///
/// The configured path wins when it exists on disk; otherwise the packaged
/// default is returned without further checks.
pub fn resolve_policy_path(configured: Option<&Path>, default: &Path) -> PathBuf {
    match configured {
        Some(path) if path.exists() => path.to_path_buf(),
        Some(path) => {
            warn!(
                configured = %path.display(),
                default = %default.display(),
                "Configured policy not found, using default"
            );
            default.to_path_buf()
        }
        None => default.to_path_buf(),
    }
}

/// Where a loaded policy came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    File(PathBuf),
    Builtin,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySource::File(path) => write!(f, "{}", path.display()),
            PolicySource::Builtin => f.write_str("<builtin>"),
        }
    }
}

/// Resolve and load the policy, falling back to the embedded copy when the
/// default file is not on disk.
pub fn load_resolved_policy(
    configured: Option<&Path>,
    default: &Path,
) -> Result<(Policy, PolicySource)> {
    let path = resolve_policy_path(configured, default);
    if path.exists() {
        let policy = Policy::load(&path)?;
        return Ok((policy, PolicySource::File(path)));
    }
    warn!(default = %default.display(), "Default policy file missing, using builtin policy");
    Ok((Policy::builtin()?, PolicySource::Builtin))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_POLICY: &str = r#"{
        "start": "BOOT",
        "accept": ["RUN", "HALT"],
        "transitions": {
            "BOOT": ["INIT"],
            "INIT": ["RUN", "HALT"],
            "RUN": ["RUN", "HALT"],
            "HALT": []
        }
    }"#;

    #[test]
    fn test_parse_full_policy() {
        let policy = Policy::from_json(SCENARIO_POLICY, None).unwrap();
        assert_eq!(policy.start.as_deref(), Some("BOOT"));
        assert!(policy.accept.contains("HALT"));
        assert_eq!(policy.describe_allowed("INIT"), "[HALT, RUN]");
        assert_eq!(policy.describe_allowed("HALT"), "[]");
        assert_eq!(policy.describe_allowed("MISSING"), "[]");
        assert!(policy.ids.is_empty());
    }

    #[test]
    fn test_empty_document_is_permissive_policy() {
        let policy = Policy::from_json("{}", None).unwrap();
        assert_eq!(policy, Policy::default());
        assert!(policy.is_permissive());
        assert!(!Policy::from_json(r#"{"start": "BOOT"}"#, None)
            .unwrap()
            .is_permissive());
    }

    #[test]
    fn test_missing_ids_error_names_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_ids.json");
        std::fs::write(&path, SCENARIO_POLICY).unwrap();

        let policy = Policy::load(&path).unwrap();
        assert_eq!(policy.origin(), Some(path.as_path()));
        match policy.id_table() {
            Err(FsmError::PolicyFormat { path: Some(p), .. }) => assert_eq!(p, path),
            other => panic!("expected PolicyFormat with path, got {other:?}"),
        }
    }

    #[test]
    fn test_transition_values_must_be_string_lists() {
        let err = Policy::from_json(r#"{"transitions": {"BOOT": "INIT"}}"#, None).unwrap_err();
        assert!(matches!(err, FsmError::PolicyFormat { .. }));

        let err = Policy::from_json(r#"{"transitions": {"BOOT": [1, 2]}}"#, None).unwrap_err();
        assert!(matches!(err, FsmError::PolicyFormat { .. }));
    }

    #[test]
    fn test_accept_must_be_list() {
        let err = Policy::from_json(r#"{"accept": "RUN"}"#, None).unwrap_err();
        assert!(matches!(err, FsmError::PolicyFormat { .. }));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Policy::from_json(
            r#"{"ids": {"BOOT": 1, "INIT": 1}}"#,
            Some(Path::new("dup.json")),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate tag id 1"), "{msg}");
        assert!(msg.contains("dup.json"), "{msg}");
    }

    #[test]
    fn test_negative_id_rejected() {
        let err = Policy::from_json(r#"{"ids": {"BOOT": -1}}"#, None).unwrap_err();
        assert!(matches!(err, FsmError::PolicyFormat { .. }));
    }

    #[test]
    fn test_id_table_requires_ids() {
        let policy = Policy::from_json(SCENARIO_POLICY, None).unwrap();
        assert!(matches!(
            policy.id_table(),
            Err(FsmError::PolicyFormat { .. })
        ));

        let builtin = Policy::builtin().unwrap();
        let table = builtin.id_table().unwrap();
        assert_eq!(table.get(&1), Some(&"BOOT"));
        assert_eq!(table.get(&4), Some(&"HALT"));
    }

    #[test]
    fn test_resolve_prefers_existing_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let configured = dir.path().join("mine.json");
        std::fs::write(&configured, "{}").unwrap();
        let default = Path::new("/nonexistent/default.json");

        assert_eq!(resolve_policy_path(Some(&configured), default), configured);
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let default = Path::new("/nonexistent/default.json");
        let missing = Path::new("/nonexistent/mine.json");

        assert_eq!(resolve_policy_path(Some(missing), default), default);
        assert_eq!(resolve_policy_path(None, default), default);
    }

    #[test]
    fn test_load_resolved_uses_builtin_when_default_absent() {
        let (policy, source) =
            load_resolved_policy(None, Path::new("/nonexistent/default.json")).unwrap();
        assert_eq!(source, PolicySource::Builtin);
        assert_eq!(policy.start.as_deref(), Some("BOOT"));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Policy::load(Path::new("/nonexistent/policy.json")).unwrap_err();
        assert!(matches!(err, FsmError::Io { .. }));
    }
}
