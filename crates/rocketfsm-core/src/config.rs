//! Per-invocation build configuration.
//!
//! Raw options arrive from CLI flags (with `ROCKETFSM_*` environment
//! fallbacks handled by clap) and an optional TOML file. They are resolved
//! exactly once into an immutable [`BuildConfig`]; stage code never looks up
//! options on its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsmError, Result};
use crate::sideband::DEFAULT_SECTION;

pub const DEFAULT_OUT_DIR: &str = "build/tagged";
pub const DEFAULT_POLICY_PATH: &str = "policies/fsm_policy.json";
pub const DEFAULT_COMPILER: &str = "clang";
pub const DEFAULT_TARGET_TRIPLE: &str = "riscv64-unknown-elf";
pub const DEFAULT_ARCH: &str = "rv64imac";
pub const DEFAULT_ABI: &str = "lp64";
pub const DEFAULT_CFLAGS: &[&str] = &["-O2"];
pub const DEFAULT_OBJCOPY: &str = "llvm-objcopy";
pub const DEFAULT_LOAD_ADDRESS: u64 = 0x8000_0000;
pub const DEFAULT_LINK_ARGS: &[&str] = &["-nostdlib", "-static"];
pub const DEFAULT_ARCHIVER: &str = "tar";

/// How the tag sequence is obtained from the build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// `TAG:<STATE>` markers in the generated assembly.
    #[default]
    Markers,
    /// The `.fsm_trace` section dumped from the object file.
    Sideband,
}

impl std::str::FromStr for TagMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "markers" => Ok(TagMode::Markers),
            "sideband" => Ok(TagMode::Sideband),
            other => Err(format!("unknown tag mode `{other}` (expected markers|sideband)")),
        }
    }
}

/// Unresolved options. `None` means "not given at this layer".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    pub source: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub policy: Option<PathBuf>,
    pub default_policy: Option<PathBuf>,
    pub tag_mode: Option<TagMode>,
    pub compiler: Option<PathBuf>,
    pub target_triple: Option<String>,
    pub arch: Option<String>,
    pub abi: Option<String>,
    pub cflags: Option<Vec<String>>,
    pub objcopy: Option<PathBuf>,
    pub sideband_section: Option<String>,
    pub link: Option<bool>,
    pub linker: Option<PathBuf>,
    pub load_address: Option<String>,
    pub link_args: Option<Vec<String>>,
    pub bundle: Option<bool>,
    pub bundle_dir: Option<PathBuf>,
    pub archive: Option<bool>,
    pub archiver: Option<PathBuf>,
}

impl BuildOptions {
    /// Parse a TOML options file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FsmError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| FsmError::Usage(format!("invalid config {}: {e}", path.display())))
    }

    /// Fill every unset option from `lower`; values already set win.
    pub fn layered_over(self, lower: BuildOptions) -> Self {
        Self {
            source: self.source.or(lower.source),
            out_dir: self.out_dir.or(lower.out_dir),
            policy: self.policy.or(lower.policy),
            default_policy: self.default_policy.or(lower.default_policy),
            tag_mode: self.tag_mode.or(lower.tag_mode),
            compiler: self.compiler.or(lower.compiler),
            target_triple: self.target_triple.or(lower.target_triple),
            arch: self.arch.or(lower.arch),
            abi: self.abi.or(lower.abi),
            cflags: self.cflags.or(lower.cflags),
            objcopy: self.objcopy.or(lower.objcopy),
            sideband_section: self.sideband_section.or(lower.sideband_section),
            link: self.link.or(lower.link),
            linker: self.linker.or(lower.linker),
            load_address: self.load_address.or(lower.load_address),
            link_args: self.link_args.or(lower.link_args),
            bundle: self.bundle.or(lower.bundle),
            bundle_dir: self.bundle_dir.or(lower.bundle_dir),
            archive: self.archive.or(lower.archive),
            archiver: self.archiver.or(lower.archiver),
        }
    }
}

/// Target description passed to the compiler and recorded in the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub triple: String,
    pub arch: String,
    pub abi: String,
}

/// Link stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub linker: PathBuf,
    pub load_address: u64,
    pub args: Vec<String>,
}

/// Bundle stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Parent of the per-source bundle directory.
    pub dir: PathBuf,
    pub archive: bool,
    pub archiver: PathBuf,
}

/// Deterministic artifact locations for one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub assembly: PathBuf,
    pub object: PathBuf,
    pub sideband_bin: PathBuf,
    pub sideband_hex: PathBuf,
    pub sideband_json: PathBuf,
    pub executable: PathBuf,
    pub bundle_dir: PathBuf,
    pub archive: PathBuf,
}

impl ArtifactPaths {
    pub fn new(out_dir: &Path, bundle_parent: &Path, stem: &str) -> Self {
        Self {
            assembly: out_dir.join(format!("{stem}.s")),
            object: out_dir.join(format!("{stem}.o")),
            sideband_bin: out_dir.join(format!("{stem}.fsm_trace.bin")),
            sideband_hex: out_dir.join(format!("{stem}.fsm_trace.hex")),
            sideband_json: out_dir.join(format!("{stem}.fsm_trace.json")),
            executable: out_dir.join(format!("{stem}.elf")),
            bundle_dir: bundle_parent.join(stem),
            archive: bundle_parent.join(format!("{stem}.tar")),
        }
    }
}

/// Immutable configuration for one build invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// C source to compile; its file stem names every artifact.
    pub source: PathBuf,
    /// Directory receiving all build artifacts.
    pub out_dir: PathBuf,
    /// Explicit policy path, used only if it exists on disk.
    pub policy: Option<PathBuf>,
    /// Packaged policy used when `policy` is absent or missing.
    pub default_policy: PathBuf,
    /// Where the validated tag sequence comes from.
    pub tag_mode: TagMode,
    /// Compiler executable.
    pub compiler: PathBuf,
    pub target: TargetConfig,
    /// Extra compiler flags, placed before the output arguments.
    pub cflags: Vec<String>,
    /// Section dumper executable, used only in sideband mode.
    pub objcopy: PathBuf,
    /// Section holding the sideband words.
    pub sideband_section: String,
    /// Present when the link stage is enabled.
    pub link: Option<LinkConfig>,
    /// Present when the bundle stage is enabled.
    pub bundle: Option<BundleConfig>,
    pub artifacts: ArtifactPaths,
}

impl BuildConfig {
    /// Apply defaults and validate. Logs the effective value of every option.
    pub fn resolve(options: BuildOptions) -> Result<Self> {
        let source = options
            .source
            .ok_or_else(|| FsmError::Usage("no source file given".to_string()))?;
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                FsmError::Usage(format!("cannot derive artifact names from {}", source.display()))
            })?
            .to_string();
        debug!(source = %source.display(), stem = %stem, "source: artifacts are named after the file stem");

        let out_dir = options.out_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));
        debug!(out_dir = %out_dir.display(), "out_dir: all build artifacts are written here");

        let default_policy = options
            .default_policy
            .unwrap_or_else(|| PathBuf::from(DEFAULT_POLICY_PATH));
        debug!(
            policy = ?options.policy,
            default_policy = %default_policy.display(),
            "policy: configured path wins when it exists, otherwise the default is used"
        );

        let tag_mode = options.tag_mode.unwrap_or_default();
        debug!(?tag_mode, "tag_mode: sideband mode adds the extract-sideband stage");

        let compiler = options.compiler.unwrap_or_else(|| PathBuf::from(DEFAULT_COMPILER));
        let target = TargetConfig {
            triple: options
                .target_triple
                .unwrap_or_else(|| DEFAULT_TARGET_TRIPLE.to_string()),
            arch: options.arch.unwrap_or_else(|| DEFAULT_ARCH.to_string()),
            abi: options.abi.unwrap_or_else(|| DEFAULT_ABI.to_string()),
        };
        let cflags = options
            .cflags
            .unwrap_or_else(|| DEFAULT_CFLAGS.iter().map(|s| s.to_string()).collect());
        debug!(
            compiler = %compiler.display(),
            triple = %target.triple,
            arch = %target.arch,
            abi = %target.abi,
            ?cflags,
            "compiler: emits assembly and object for the target"
        );

        let objcopy = options.objcopy.unwrap_or_else(|| PathBuf::from(DEFAULT_OBJCOPY));
        let sideband_section = options
            .sideband_section
            .unwrap_or_else(|| DEFAULT_SECTION.to_string());
        debug!(
            objcopy = %objcopy.display(),
            section = %sideband_section,
            "objcopy: dumps the sideband section in sideband mode"
        );

        let link = if options.link.unwrap_or(false) {
            let load_address = match options.load_address.as_deref() {
                Some(raw) => parse_address(raw)?,
                None => DEFAULT_LOAD_ADDRESS,
            };
            let link = LinkConfig {
                linker: options.linker.unwrap_or_else(|| compiler.clone()),
                load_address,
                args: options
                    .link_args
                    .unwrap_or_else(|| DEFAULT_LINK_ARGS.iter().map(|s| s.to_string()).collect()),
            };
            debug!(
                linker = %link.linker.display(),
                load_address = %format!("0x{load_address:x}"),
                args = ?link.args,
                "link: produces the executable image"
            );
            Some(link)
        } else {
            debug!("link: disabled");
            None
        };

        let bundle = if options.bundle.unwrap_or(false) {
            let bundle = BundleConfig {
                dir: options.bundle_dir.unwrap_or_else(|| out_dir.join("bundle")),
                archive: options.archive.unwrap_or(false),
                archiver: options
                    .archiver
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVER)),
            };
            debug!(
                dir = %bundle.dir.display(),
                archive = bundle.archive,
                "bundle: copies artifacts and writes the content-hash manifest"
            );
            Some(bundle)
        } else {
            if options.archive.unwrap_or(false) {
                return Err(FsmError::Usage(
                    "archiving requires the bundle stage to be enabled".to_string(),
                ));
            }
            debug!("bundle: disabled");
            None
        };

        let bundle_parent = bundle
            .as_ref()
            .map(|b| b.dir.clone())
            .unwrap_or_else(|| out_dir.join("bundle"));
        let artifacts = ArtifactPaths::new(&out_dir, &bundle_parent, &stem);
        if bundle.is_some() {
            check_bundle_dir(&artifacts.bundle_dir, &out_dir)?;
        }

        Ok(Self {
            source,
            out_dir,
            policy: options.policy,
            default_policy,
            tag_mode,
            compiler,
            target,
            cflags,
            objcopy,
            sideband_section,
            link,
            bundle,
            artifacts,
        })
    }
}

/// The bundle directory is recreated on every run, so it must not be the
/// output directory or one of its ancestors.
fn check_bundle_dir(bundle_dir: &Path, out_dir: &Path) -> Result<()> {
    let bundle_abs = std::path::absolute(bundle_dir).map_err(|e| FsmError::io(bundle_dir, e))?;
    let out_abs = std::path::absolute(out_dir).map_err(|e| FsmError::io(out_dir, e))?;
    if out_abs.starts_with(&bundle_abs) {
        return Err(FsmError::Usage(format!(
            "bundle directory {} would remove the build outputs in {}",
            bundle_dir.display(),
            out_dir.display()
        )));
    }
    Ok(())
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_address(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => trimmed.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|_| FsmError::Usage(format!("invalid load address `{raw}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_source(path: &str) -> BuildOptions {
        BuildOptions {
            source: Some(PathBuf::from(path)),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = BuildConfig::resolve(with_source("examples/hello_tagged.c")).unwrap();
        assert_eq!(config.out_dir, PathBuf::from(DEFAULT_OUT_DIR));
        assert_eq!(config.tag_mode, TagMode::Markers);
        assert_eq!(config.target.triple, DEFAULT_TARGET_TRIPLE);
        assert_eq!(config.cflags, vec!["-O2"]);
        assert!(config.link.is_none());
        assert!(config.bundle.is_none());
        assert_eq!(
            config.artifacts.assembly,
            PathBuf::from("build/tagged/hello_tagged.s")
        );
        assert_eq!(
            config.artifacts.bundle_dir,
            PathBuf::from("build/tagged/bundle/hello_tagged")
        );
    }

    #[test]
    fn test_bundle_dir_must_not_contain_out_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = with_source("demo.c");
        opts.bundle = Some(true);
        opts.out_dir = Some(tmp.path().join("demo"));
        opts.bundle_dir = Some(tmp.path().to_path_buf());
        let err = BuildConfig::resolve(opts.clone()).unwrap_err();
        assert!(matches!(err, FsmError::Usage(_)), "{err}");

        opts.out_dir = Some(tmp.path().join("demo").join("nested"));
        assert!(matches!(
            BuildConfig::resolve(opts.clone()),
            Err(FsmError::Usage(_))
        ));

        opts.out_dir = Some(tmp.path().join("out"));
        let config = BuildConfig::resolve(opts).unwrap();
        assert_eq!(config.artifacts.bundle_dir, tmp.path().join("demo"));
    }

    #[test]
    fn test_missing_source_is_usage_error() {
        let err = BuildConfig::resolve(BuildOptions::default()).unwrap_err();
        assert!(matches!(err, FsmError::Usage(_)));
    }

    #[test]
    fn test_link_defaults_to_compiler_driver() {
        let mut opts = with_source("demo.c");
        opts.link = Some(true);
        opts.compiler = Some(PathBuf::from("/opt/riscv/bin/clang"));
        let config = BuildConfig::resolve(opts).unwrap();
        let link = config.link.unwrap();
        assert_eq!(link.linker, PathBuf::from("/opt/riscv/bin/clang"));
        assert_eq!(link.load_address, DEFAULT_LOAD_ADDRESS);
        assert_eq!(link.args, vec!["-nostdlib", "-static"]);
    }

    #[test]
    fn test_archive_without_bundle_rejected() {
        let mut opts = with_source("demo.c");
        opts.archive = Some(true);
        assert!(matches!(
            BuildConfig::resolve(opts),
            Err(FsmError::Usage(_))
        ));
    }

    #[test]
    fn test_layering_prefers_upper_values() {
        let upper = BuildOptions {
            arch: Some("rv32imac".to_string()),
            ..Default::default()
        };
        let lower = BuildOptions {
            arch: Some("rv64gc".to_string()),
            abi: Some("ilp32".to_string()),
            ..Default::default()
        };
        let merged = upper.layered_over(lower);
        assert_eq!(merged.arch.as_deref(), Some("rv32imac"));
        assert_eq!(merged.abi.as_deref(), Some("ilp32"));
    }

    #[test]
    fn test_toml_file_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rocketfsm.toml");
        std::fs::write(
            &path,
            r#"
tag_mode = "sideband"
link = true
load_address = "0x8000_2000"
cflags = ["-O0", "-g"]
"#,
        )
        .unwrap();
        let opts = BuildOptions::from_toml_file(&path).unwrap();
        assert_eq!(opts.tag_mode, Some(TagMode::Sideband));

        let config = BuildConfig::resolve(with_source("demo.c").layered_over(opts)).unwrap();
        assert_eq!(config.link.unwrap().load_address, 0x8000_2000);
        assert_eq!(config.cflags, vec!["-O0", "-g"]);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rocketfsm.toml");
        std::fs::write(&path, "optimise = true\n").unwrap();
        assert!(matches!(
            BuildOptions::from_toml_file(&path),
            Err(FsmError::Usage(_))
        ));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x80000000").unwrap(), 0x8000_0000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
    }
}
