//! Artifact pipeline orchestration.
//!
//! Stages run strictly in [`Stage::ORDER`], each one consuming artifacts
//! recorded by earlier stages. The first failure stops the run; artifacts
//! already on disk are left in place and are overwritten by the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bundle::{assemble_bundle, ArchiveOutcome, BundleOutput};
use crate::config::BuildConfig;
use crate::error::{FsmError, Result};
use crate::extract::TagInput;
use crate::policy::{Policy, PolicySource};
use crate::runner::{run_checked, ToolRunner};
use crate::sideband::write_sideband_artifacts;
use crate::stage::{Artifact, ArtifactKind, Stage, StagePlan, StageState};
use crate::toolchain;
use crate::validate::{validate, ValidationResult};

/// State of one planned stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub state: StageState,
}

/// Mutable accumulator for one orchestration invocation.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Correlates log lines of one invocation.
    pub run_id: String,

    pub source: PathBuf,

    pub policy_source: PolicySource,

    /// One record per planned stage, in execution order.
    pub records: Vec<StageRecord>,

    /// Artifacts produced by each finished stage.
    pub outputs: BTreeMap<Stage, Vec<Artifact>>,

    /// Set once the validate stage has run, whatever its outcome.
    pub validation: Option<ValidationResult>,

    /// Decoded sideband words, when the sideband was extracted.
    pub sideband_words: Option<Vec<u32>>,

    pub bundle: Option<BundleOutput>,
}

impl PipelineRun {
    fn new(source: &Path, policy_source: PolicySource, plan: &StagePlan) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            source: source.to_path_buf(),
            policy_source,
            records: plan
                .stages()
                .iter()
                .map(|stage| StageRecord {
                    stage: *stage,
                    state: StageState::Pending,
                })
                .collect(),
            outputs: BTreeMap::new(),
            validation: None,
            sideband_words: None,
            bundle: None,
        }
    }

    pub fn state(&self, stage: Stage) -> Option<&StageState> {
        self.records
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.state)
    }

    pub fn succeeded(&self, stage: Stage) -> bool {
        matches!(self.state(stage), Some(StageState::Succeeded { .. }))
    }

    /// Path of the most recently produced artifact of `kind`.
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Path> {
        self.outputs
            .values()
            .flatten()
            .rev()
            .find(|a| a.kind == kind)
            .map(|a| a.path.as_path())
    }

    /// Every artifact path produced so far, in stage order.
    pub fn produced_paths(&self) -> Vec<&Path> {
        self.outputs
            .values()
            .flatten()
            .map(|a| a.path.as_path())
            .collect()
    }

    fn require(&self, kind: ArtifactKind, stage: Stage) -> Result<PathBuf> {
        self.artifact(kind).map(Path::to_path_buf).ok_or_else(|| {
            FsmError::Usage(format!(
                "stage {stage} needs a {kind:?} artifact but no earlier stage produced one"
            ))
        })
    }

    fn advance(&mut self, stage: Stage, next: StageState) {
        if let Some(record) = self.records.iter_mut().find(|r| r.stage == stage) {
            debug_assert!(
                record.state.can_advance_to(&next),
                "illegal stage transition for {stage}: {:?} -> {:?}",
                record.state,
                next
            );
            record.state = next;
        }
    }
}

/// First failure of a pipeline run.
#[derive(Debug, Error)]
#[error("stage {stage} failed [{}]: {error}", .error.kind())]
pub struct PipelineFailure {
    pub stage: Stage,

    #[source]
    pub error: FsmError,

    /// The run as it stood when the stage failed.
    pub run: Box<PipelineRun>,
}

/// Drives one build through its planned stages.
pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    policy: &'a Policy,
    policy_source: PolicySource,
    runner: &'a dyn ToolRunner,
    plan: StagePlan,
    generated_at: Option<DateTime<Utc>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a BuildConfig,
        policy: &'a Policy,
        policy_source: PolicySource,
        runner: &'a dyn ToolRunner,
    ) -> Self {
        Self {
            config,
            policy,
            policy_source,
            runner,
            plan: StagePlan::from_config(config),
            generated_at: None,
        }
    }

    /// Replace the plan derived from the configuration.
    pub fn with_plan(mut self, plan: StagePlan) -> Self {
        self.plan = plan;
        self
    }

    /// Pin the bundle manifest timestamp.
    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.generated_at = Some(ts);
        self
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run every planned stage, stopping at the first failure.
    pub async fn run(&self) -> std::result::Result<PipelineRun, PipelineFailure> {
        let mut run = PipelineRun::new(&self.config.source, self.policy_source.clone(), &self.plan);
        let span = info_span!("pipeline", run_id = %run.run_id);

        async {
            info!(
                source = %self.config.source.display(),
                stages = ?self.plan.stages().iter().map(Stage::name).collect::<Vec<_>>(),
                policy = %self.policy_source,
                "Starting pipeline"
            );

            for &stage in self.plan.stages() {
                run.advance(stage, StageState::Running);
                info!(stage = %stage, "Executing stage");
                let start = Instant::now();

                match self.execute(stage, &mut run).await {
                    Ok(outputs) => {
                        let duration_ms = start.elapsed().as_millis() as u64;
                        info!(stage = %stage, duration_ms, artifacts = outputs.len(), "Stage succeeded");
                        run.outputs.insert(stage, outputs.clone());
                        run.advance(
                            stage,
                            StageState::Succeeded {
                                outputs,
                                duration_ms,
                            },
                        );
                    }
                    Err(error) => {
                        warn!(stage = %stage, kind = %error.kind(), error = %error, "Stage failed");
                        run.advance(
                            stage,
                            StageState::Failed {
                                kind: error.kind(),
                                message: error.to_string(),
                            },
                        );
                        return Err(PipelineFailure {
                            stage,
                            error,
                            run: Box::new(run),
                        });
                    }
                }
            }

            info!("Pipeline completed successfully");
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, stage: Stage, run: &mut PipelineRun) -> Result<Vec<Artifact>> {
        match stage {
            Stage::Compile => self.compile().await,
            Stage::ExtractSideband => self.extract_sideband(run).await,
            Stage::Validate => self.check_tags(run),
            Stage::Link => self.link(run).await,
            Stage::AssembleBundle => self.assemble(run).await,
        }
    }

    async fn compile(&self) -> Result<Vec<Artifact>> {
        let out_dir = &self.config.out_dir;
        std::fs::create_dir_all(out_dir).map_err(|e| FsmError::io(out_dir, e))?;
        if !self.config.source.exists() {
            return Err(FsmError::io(
                &self.config.source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "source file not found"),
            ));
        }

        run_checked(self.runner, &toolchain::compile_assembly(self.config)).await?;
        run_checked(self.runner, &toolchain::compile_object(self.config)).await?;

        Ok(vec![
            Artifact::new(ArtifactKind::Assembly, &self.config.artifacts.assembly),
            Artifact::new(ArtifactKind::Object, &self.config.artifacts.object),
        ])
    }

    async fn extract_sideband(&self, run: &mut PipelineRun) -> Result<Vec<Artifact>> {
        // words cannot be mapped without ids; fail before dumping anything
        self.policy.id_table()?;
        let object = run.require(ArtifactKind::Object, Stage::ExtractSideband)?;
        let paths = &self.config.artifacts;

        run_checked(self.runner, &toolchain::dump_section(self.config)).await?;

        let sideband = write_sideband_artifacts(
            &self.config.sideband_section,
            &object,
            &paths.sideband_bin,
            &paths.sideband_hex,
            &paths.sideband_json,
        )?;
        info!(words = sideband.words.len(), "Extracted sideband stream");
        run.sideband_words = Some(sideband.words);

        Ok(vec![
            Artifact::new(ArtifactKind::SidebandBin, &paths.sideband_bin),
            Artifact::new(ArtifactKind::SidebandHex, sideband.hex),
            Artifact::new(ArtifactKind::SidebandManifest, sideband.manifest),
        ])
    }

    fn check_tags(&self, run: &mut PipelineRun) -> Result<Vec<Artifact>> {
        let input = if self.plan.contains(Stage::ExtractSideband) {
            TagInput::Sideband(run.require(ArtifactKind::SidebandBin, Stage::Validate)?)
        } else {
            TagInput::Markers(run.require(ArtifactKind::Assembly, Stage::Validate)?)
        };

        let sequence = input.extract(self.policy)?;
        let result = validate(&sequence, self.policy);
        info!(
            input = %input.path().display(),
            outcome = ?result.outcome,
            trace = %result.trace_line(),
            "Validated tag sequence"
        );
        run.validation = Some(result.clone());
        result.into_result()?;
        Ok(Vec::new())
    }

    async fn link(&self, run: &mut PipelineRun) -> Result<Vec<Artifact>> {
        run.require(ArtifactKind::Object, Stage::Link)?;
        let Some(link) = &self.config.link else {
            return Err(FsmError::Usage(
                "link stage planned without link configuration".to_string(),
            ));
        };

        run_checked(self.runner, &toolchain::link(self.config, link)).await?;
        Ok(vec![Artifact::new(
            ArtifactKind::Executable,
            &self.config.artifacts.executable,
        )])
    }

    async fn assemble(&self, run: &mut PipelineRun) -> Result<Vec<Artifact>> {
        let Some(bundle) = &self.config.bundle else {
            return Err(FsmError::Usage(
                "assemble-bundle stage planned without bundle configuration".to_string(),
            ));
        };

        let output = assemble_bundle(
            run,
            self.config,
            bundle,
            self.policy,
            self.runner,
            self.generated_at,
        )
        .await?;

        let mut artifacts = vec![
            Artifact::new(ArtifactKind::BundleDir, &output.dir),
            Artifact::new(ArtifactKind::BundleManifest, &output.manifest_path),
        ];
        if let Some(ArchiveOutcome::Created(path)) = &output.archive {
            artifacts.push(Artifact::new(ArtifactKind::Archive, path));
        }
        run.bundle = Some(output);
        Ok(artifacts)
    }
}
