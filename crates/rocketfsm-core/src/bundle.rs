//! Deployment bundle assembly.
//!
//! A bundle is a pure function of one validated pipeline run: the directory
//! is recreated from scratch, the designated artifacts are copied in, every
//! copy is hashed, and `bundle-manifest.json` is written last.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BuildConfig, BundleConfig, TargetConfig};
use crate::digest::ContentHash;
use crate::error::{FsmError, Result};
use crate::pipeline::PipelineRun;
use crate::policy::{Policy, PolicySource};
use crate::runner::{run_checked, ToolRunner};
use crate::sideband::{format_word, write_json};
use crate::stage::ArtifactKind;
use crate::toolchain;

/// File name of the manifest inside the bundle directory.
pub const MANIFEST_NAME: &str = "bundle-manifest.json";

/// Name used when the embedded policy has no file of its own.
pub const BUILTIN_POLICY_NAME: &str = "fsm_policy.json";

/// Artifacts copied into a bundle, in copy order.
const BUNDLED_KINDS: [ArtifactKind; 6] = [
    ArtifactKind::Executable,
    ArtifactKind::Object,
    ArtifactKind::Assembly,
    ArtifactKind::SidebandBin,
    ArtifactKind::SidebandHex,
    ArtifactKind::SidebandManifest,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFile {
    pub name: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAddresses {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebandSummary {
    pub section: String,
    pub word_count: usize,
    pub words: Vec<u32>,
    pub hex_words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkerSummary {
    pub path: PathBuf,
    pub args: Vec<String>,
}

/// Record of a bundle's contents, written once after every copy completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub generated_at: DateTime<Utc>,
    pub source: PathBuf,
    pub target: TargetConfig,
    pub load_addresses: Option<LoadAddresses>,
    pub sideband: Option<SidebandSummary>,
    pub linker: Option<LinkerSummary>,
    pub policy: String,
    pub files: Vec<BundleFile>,
}

/// Result of the optional archive step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created(PathBuf),
    /// The directory and manifest stay valid when archiving fails.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutput {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: BundleManifest,
    /// `None` when archiving is disabled.
    pub archive: Option<ArchiveOutcome>,
}

/// Build the bundle for a run whose validate stage succeeded.
pub async fn assemble_bundle(
    run: &PipelineRun,
    config: &BuildConfig,
    bundle: &BundleConfig,
    policy: &Policy,
    runner: &dyn ToolRunner,
    generated_at: Option<DateTime<Utc>>,
) -> Result<BundleOutput> {
    debug_assert!(
        run.validation.as_ref().is_some_and(|v| v.passed()),
        "bundle assembled for a run without a passing validation"
    );

    let dir = config.artifacts.bundle_dir.clone();
    recreate_dir(&dir)?;

    let mut copied = Vec::new();
    for kind in BUNDLED_KINDS {
        if let Some(src) = run.artifact(kind) {
            copied.push(copy_into(src, &dir)?);
        }
    }
    copied.push(bundle_policy(&run.policy_source, policy, &dir)?);

    let files = copied
        .iter()
        .map(|path| describe_file(path))
        .collect::<Result<Vec<_>>>()?;

    let manifest = BundleManifest {
        generated_at: generated_at.unwrap_or_else(Utc::now),
        source: run.source.clone(),
        target: config.target.clone(),
        load_addresses: config.link.as_ref().map(|link| LoadAddresses {
            text: format!("0x{:08x}", link.load_address),
        }),
        sideband: run.sideband_words.as_ref().map(|words| SidebandSummary {
            section: config.sideband_section.clone(),
            word_count: words.len(),
            words: words.clone(),
            hex_words: words.iter().map(|w| format_word(*w)).collect(),
        }),
        linker: config.link.as_ref().map(|link| LinkerSummary {
            path: link.linker.clone(),
            args: toolchain::link_arguments(config, link),
        }),
        policy: run.policy_source.to_string(),
        files,
    };

    let manifest_path = dir.join(MANIFEST_NAME);
    write_json(&manifest_path, &manifest)?;
    info!(
        dir = %dir.display(),
        files = manifest.files.len(),
        "Wrote bundle manifest"
    );

    let archive = if bundle.archive {
        Some(archive_bundle(&dir, &config.artifacts.archive, &bundle.archiver, runner).await)
    } else {
        None
    };

    Ok(BundleOutput {
        dir,
        manifest_path,
        manifest,
        archive,
    })
}

/// Remove `dir` if present, then create it empty.
fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| FsmError::io(dir, e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| FsmError::io(dir, e))
}

/// Copy `src` into `dir` under its base name.
fn copy_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src.file_name().ok_or_else(|| {
        FsmError::io(
            src,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact has no file name"),
        )
    })?;
    let dest = dir.join(name);
    std::fs::copy(src, &dest).map_err(|e| FsmError::io(src, e))?;
    Ok(dest)
}

fn bundle_policy(source: &PolicySource, policy: &Policy, dir: &Path) -> Result<PathBuf> {
    match source {
        PolicySource::File(path) => copy_into(path, dir),
        PolicySource::Builtin => {
            let dest = dir.join(BUILTIN_POLICY_NAME);
            write_json(&dest, policy)?;
            Ok(dest)
        }
    }
}

fn describe_file(path: &Path) -> Result<BundleFile> {
    let size_bytes = std::fs::metadata(path)
        .map_err(|e| FsmError::io(path, e))?
        .len();
    Ok(BundleFile {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes,
        content_hash: ContentHash::of_file(path)?,
    })
}

/// Directory entry names sorted for a reproducible archive order.
pub fn sorted_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = std::fs::read_dir(dir)
        .map_err(|e| FsmError::io(dir, e))?
        .map(|entry| {
            entry
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .map_err(|e| FsmError::io(dir, e))
        })
        .collect::<Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

async fn archive_bundle(
    dir: &Path,
    archive: &Path,
    archiver: &Path,
    runner: &dyn ToolRunner,
) -> ArchiveOutcome {
    let attempt = async {
        let entries = sorted_entries(dir)?;
        let target = std::path::absolute(archive).map_err(|e| FsmError::io(archive, e))?;
        run_checked(runner, &toolchain::archive(archiver, dir, &target, &entries)).await?;
        Ok::<_, FsmError>(target)
    };

    match attempt.await {
        Ok(path) => {
            info!(archive = %path.display(), "Archived bundle");
            ArchiveOutcome::Created(path)
        }
        Err(e) => {
            warn!(error = %e, "Bundle archive failed; directory and manifest are kept");
            ArchiveOutcome::Failed {
                message: e.to_string(),
            }
        }
    }
}
