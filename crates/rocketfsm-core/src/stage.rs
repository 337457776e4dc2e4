//! Pipeline stage definitions and per-stage state.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{BuildConfig, TagMode};
use crate::error::ErrorKind;

/// Pipeline stages in their fixed dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Source to assembly and object.
    Compile,
    /// Object section dump to sideband bin/hex/json.
    ExtractSideband,
    /// Tag sequence checked against the policy.
    Validate,
    /// Object to executable image.
    Link,
    /// Copy, hash and manifest the artifacts.
    AssembleBundle,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ORDER: [Stage; 5] = [
        Stage::Compile,
        Stage::ExtractSideband,
        Stage::Validate,
        Stage::Link,
        Stage::AssembleBundle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::ExtractSideband => "extract-sideband",
            Stage::Validate => "validate",
            Stage::Link => "link",
            Stage::AssembleBundle => "assemble-bundle",
        }
    }

    /// Whether the stage may be left out of a plan.
    pub fn optional(&self) -> bool {
        matches!(
            self,
            Stage::ExtractSideband | Stage::Link | Stage::AssembleBundle
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kinds of files a stage can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Assembly,
    Object,
    SidebandBin,
    SidebandHex,
    SidebandManifest,
    Executable,
    BundleDir,
    BundleManifest,
    Archive,
}

/// A file produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Lifecycle of a stage within one run. Only moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded {
        outputs: Vec<Artifact>,
        duration_ms: u64,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Succeeded { .. } | StageState::Failed { .. })
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: &StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::Running)
                | (StageState::Running, StageState::Succeeded { .. })
                | (StageState::Running, StageState::Failed { .. })
        )
    }
}

/// The ordered set of stages one invocation will run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Enable stages from the resolved configuration.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::with_enabled(|stage| match stage {
            Stage::Compile | Stage::Validate => true,
            Stage::ExtractSideband => config.tag_mode == TagMode::Sideband,
            Stage::Link => config.link.is_some(),
            Stage::AssembleBundle => config.bundle.is_some(),
        })
    }

    /// Keep the stages `enabled` accepts; mandatory stages are always kept.
    pub fn with_enabled(enabled: impl Fn(Stage) -> bool) -> Self {
        Self {
            stages: Stage::ORDER
                .into_iter()
                .filter(|s| !s.optional() || enabled(*s))
                .collect(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildOptions;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Compile.name(), "compile");
        assert_eq!(Stage::ExtractSideband.name(), "extract-sideband");
        assert_eq!(Stage::AssembleBundle.to_string(), "assemble-bundle");
    }

    #[test]
    fn test_order_is_dependency_order() {
        let mut sorted = Stage::ORDER;
        sorted.sort();
        assert_eq!(sorted, Stage::ORDER);
    }

    #[test]
    fn test_minimal_plan() {
        let plan = StagePlan::with_enabled(|_| false);
        assert_eq!(plan.stages(), &[Stage::Compile, Stage::Validate]);
    }

    #[test]
    fn test_full_plan_from_config() {
        let config = BuildConfig::resolve(BuildOptions {
            source: Some("demo.c".into()),
            tag_mode: Some(TagMode::Sideband),
            link: Some(true),
            bundle: Some(true),
            ..Default::default()
        })
        .unwrap();
        let plan = StagePlan::from_config(&config);
        assert_eq!(plan.stages(), &Stage::ORDER);
    }

    #[test]
    fn test_state_transitions_only_move_forward() {
        let done = StageState::Succeeded {
            outputs: vec![],
            duration_ms: 1,
        };
        let failed = StageState::Failed {
            kind: ErrorKind::IOError,
            message: "x".to_string(),
        };
        assert!(StageState::Pending.can_advance_to(&StageState::Running));
        assert!(StageState::Running.can_advance_to(&done));
        assert!(StageState::Running.can_advance_to(&failed));
        assert!(!StageState::Pending.can_advance_to(&done));
        assert!(!done.can_advance_to(&StageState::Running));
        assert!(!failed.can_advance_to(&StageState::Pending));
        assert!(done.is_terminal() && failed.is_terminal());
    }
}
