//! RocketFSM CLI
//!
//! The `rocketfsm` command validates FSM tag sequences and drives the tagged
//! build pipeline.
//!
//! ## Commands
//!
//! - `check`: Validate assembly markers or a sideband dump against a policy
//! - `build`: Compile, extract, validate, link and bundle one C source

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, Level};

use rocketfsm_core::config::DEFAULT_POLICY_PATH;
use rocketfsm_core::{
    load_resolved_policy, ArchiveOutcome, BuildConfig, BuildOptions, ErrorKind, FsmError, Pipeline,
    PipelineFailure, PipelineRun, SystemToolRunner, TagInput, TagMode, ValidationResult,
};

#[derive(Parser)]
#[command(name = "rocketfsm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "FSM tag-sequence validation for tagged RISC-V payloads", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines (and a JSON result for `check`)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a tag sequence against an FSM policy
    Check {
        /// Policy document (falls back to the default when missing)
        #[arg(long, env = "ROCKETFSM_POLICY")]
        policy: Option<PathBuf>,

        /// Default policy document
        #[arg(long, env = "ROCKETFSM_DEFAULT_POLICY", default_value = DEFAULT_POLICY_PATH)]
        default_policy: PathBuf,

        /// Assembly file carrying TAG:<STATE> markers
        #[arg(long, conflicts_with = "sideband_bin")]
        asm: Option<PathBuf>,

        /// Raw little-endian sideband dump
        #[arg(long)]
        sideband_bin: Option<PathBuf>,
    },

    /// Run the tagged build pipeline for one C source
    Build(BuildArgs),
}

#[derive(Args, Debug, Default)]
struct BuildArgs {
    /// C source file
    source: Option<PathBuf>,

    /// TOML file with build options (flags and environment take precedence)
    #[arg(long, env = "ROCKETFSM_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory for build artifacts
    #[arg(long, env = "ROCKETFSM_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Policy document
    #[arg(long, env = "ROCKETFSM_POLICY")]
    policy: Option<PathBuf>,

    /// Default policy document
    #[arg(long, env = "ROCKETFSM_DEFAULT_POLICY")]
    default_policy: Option<PathBuf>,

    /// Tag source: markers or sideband
    #[arg(long, env = "ROCKETFSM_TAG_MODE")]
    tag_mode: Option<TagMode>,

    /// Compiler executable
    #[arg(long, env = "ROCKETFSM_COMPILER")]
    compiler: Option<PathBuf>,

    /// Target triple
    #[arg(long, env = "ROCKETFSM_TARGET")]
    target: Option<String>,

    /// Target architecture (-march)
    #[arg(long, env = "ROCKETFSM_ARCH")]
    arch: Option<String>,

    /// Target ABI (-mabi)
    #[arg(long, env = "ROCKETFSM_ABI")]
    abi: Option<String>,

    /// Compiler flag (repeatable)
    #[arg(long = "cflag", env = "ROCKETFSM_CFLAGS", value_delimiter = ' ', allow_hyphen_values = true)]
    cflags: Vec<String>,

    /// Section dumper executable
    #[arg(long, env = "ROCKETFSM_OBJCOPY")]
    objcopy: Option<PathBuf>,

    /// Sideband section name
    #[arg(long, env = "ROCKETFSM_SIDEBAND_SECTION")]
    sideband_section: Option<String>,

    /// Link the object into an executable image
    #[arg(long, env = "ROCKETFSM_LINK")]
    link: bool,

    /// Linker driver (defaults to the compiler)
    #[arg(long, env = "ROCKETFSM_LINKER")]
    linker: Option<PathBuf>,

    /// Text load address, hex or decimal
    #[arg(long, env = "ROCKETFSM_LOAD_ADDRESS")]
    load_address: Option<String>,

    /// Linker argument (repeatable)
    #[arg(long = "link-arg", env = "ROCKETFSM_LINK_ARGS", value_delimiter = ' ', allow_hyphen_values = true)]
    link_args: Vec<String>,

    /// Assemble a deployment bundle after validation
    #[arg(long, env = "ROCKETFSM_BUNDLE")]
    bundle: bool,

    /// Parent directory for bundles
    #[arg(long, env = "ROCKETFSM_BUNDLE_DIR")]
    bundle_dir: Option<PathBuf>,

    /// Also archive the bundle directory
    #[arg(long, env = "ROCKETFSM_ARCHIVE")]
    archive: bool,

    /// Archiver executable
    #[arg(long, env = "ROCKETFSM_ARCHIVER")]
    archiver: Option<PathBuf>,
}

impl BuildArgs {
    /// Options set on the command line or through the environment.
    fn options(&self) -> BuildOptions {
        fn non_empty(values: &[String]) -> Option<Vec<String>> {
            (!values.is_empty()).then(|| values.to_vec())
        }

        BuildOptions {
            source: self.source.clone(),
            out_dir: self.out_dir.clone(),
            policy: self.policy.clone(),
            default_policy: self.default_policy.clone(),
            tag_mode: self.tag_mode,
            compiler: self.compiler.clone(),
            target_triple: self.target.clone(),
            arch: self.arch.clone(),
            abi: self.abi.clone(),
            cflags: non_empty(&self.cflags),
            objcopy: self.objcopy.clone(),
            sideband_section: self.sideband_section.clone(),
            link: self.link.then_some(true),
            linker: self.linker.clone(),
            load_address: self.load_address.clone(),
            link_args: non_empty(&self.link_args),
            bundle: self.bundle.then_some(true),
            bundle_dir: self.bundle_dir.clone(),
            archive: self.archive.then_some(true),
            archiver: self.archiver.clone(),
        }
    }

    /// Layer flags over the optional config file.
    fn resolve(&self) -> Result<BuildConfig, FsmError> {
        let options = match &self.config {
            Some(path) => self.options().layered_over(BuildOptions::from_toml_file(path)?),
            None => self.options(),
        };
        BuildConfig::resolve(options)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    rocketfsm_core::init_tracing(cli.json, level);

    let outcome = match cli.command {
        Commands::Check {
            policy,
            default_policy,
            asm,
            sideband_bin,
        } => cmd_check(policy.as_deref(), &default_policy, asm, sideband_bin, cli.json),
        Commands::Build(args) => cmd_build(&args).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport<'a> {
    policy: String,
    input: &'a Path,
    #[serde(flatten)]
    result: &'a ValidationResult,
    messages: Vec<String>,
}

/// Machine-readable form of an input or format error.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport {
    kind: ErrorKind,
    exit_code: i32,
    message: String,
}

impl From<&FsmError> for ErrorReport {
    fn from(error: &FsmError) -> Self {
        Self {
            kind: error.kind(),
            exit_code: error.exit_code(),
            message: error.to_string(),
        }
    }
}

/// Validate one input file; exit 0 on PASS, 1 on FAIL, 2 on input errors.
fn cmd_check(
    policy: Option<&Path>,
    default_policy: &Path,
    asm: Option<PathBuf>,
    sideband_bin: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let checked = TagInput::select(asm, sideband_bin).and_then(|input| {
        let (policy, source) = load_resolved_policy(policy, default_policy)?;
        debug!(policy = %source, input = %input.path().display(), "Checking tag sequence");
        let result = rocketfsm_core::check(&input, &policy)?;
        Ok((input, source, result))
    });

    let (input, source, result) = match checked {
        Ok(checked) => checked,
        Err(e) if json => {
            println!("{}", serde_json::to_string_pretty(&ErrorReport::from(&e))?);
            return Ok(exit_status(&e));
        }
        Err(e) => return Ok(report_error(&e)),
    };

    if json {
        let report = CheckReport {
            policy: source.to_string(),
            input: input.path(),
            result: &result,
            messages: result.messages(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_validation(&result);
    }

    Ok(if result.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_validation(result: &ValidationResult) {
    if result.passed() {
        println!("FSM CHECK PASS");
    } else {
        println!("FSM CHECK FAIL");
        for message in result.messages() {
            println!("  - {}", message);
        }
    }
    if !result.trace.is_empty() {
        println!("Tag trace: {}", result.trace_line());
    }
}

/// Run the pipeline and report produced artifacts or the failing stage.
async fn cmd_build(args: &BuildArgs) -> Result<ExitCode> {
    let prepared = args.resolve().and_then(|config| {
        let (policy, source) =
            load_resolved_policy(config.policy.as_deref(), &config.default_policy)?;
        Ok((config, policy, source))
    });
    let (config, policy, policy_source) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return Ok(report_error(&e)),
    };

    let runner = SystemToolRunner;
    let pipeline = Pipeline::new(&config, &policy, policy_source, &runner);

    match pipeline.run().await {
        Ok(run) => {
            print_run(&run);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            print_failure(&failure);
            Ok(exit_status(&failure.error))
        }
    }
}

fn print_run(run: &PipelineRun) {
    println!("✓ Build passed (run {})", run.run_id);
    if let Some(validation) = &run.validation {
        println!("Tag trace: {}", validation.trace_line());
    }
    println!();
    for path in run.produced_paths() {
        println!("  {}", path.display());
    }
    if let Some(bundle) = &run.bundle {
        println!();
        println!("Bundle: {}", bundle.dir.display());
        println!("Manifest: {}", bundle.manifest_path.display());
        match &bundle.archive {
            Some(ArchiveOutcome::Created(path)) => println!("Archive: {}", path.display()),
            Some(ArchiveOutcome::Failed { message }) => {
                println!("Archive: ✗ not created ({})", message)
            }
            None => {}
        }
    }
}

fn print_failure(failure: &PipelineFailure) {
    println!("✗ {}", failure);
    match &failure.error {
        FsmError::ToolInvocation {
            command,
            stdout,
            stderr,
            ..
        } => {
            println!("Command: {}", command);
            if !stdout.trim().is_empty() {
                println!("--- stdout ---\n{}", stdout.trim_end());
            }
            if !stderr.trim().is_empty() {
                println!("--- stderr ---\n{}", stderr.trim_end());
            }
        }
        FsmError::PolicyViolation { violations, trace } => {
            for violation in violations {
                println!("  - {}", violation);
            }
            if !trace.is_empty() {
                println!("Tag trace: {}", trace.join(" -> "));
            }
        }
        _ => {}
    }
    let produced = failure.run.produced_paths();
    if !produced.is_empty() {
        println!();
        println!("Partial artifacts:");
        for path in produced {
            println!("  {}", path.display());
        }
    }
}

fn report_error(error: &FsmError) -> ExitCode {
    eprintln!("✗ [{}] {}", error.kind(), error);
    exit_status(error)
}

fn exit_status(error: &FsmError) -> ExitCode {
    ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_rejects_both_inputs() {
        let parsed = Cli::try_parse_from([
            "rocketfsm",
            "check",
            "--asm",
            "demo.s",
            "--sideband-bin",
            "demo.bin",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_build_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "rocketfsm",
            "build",
            "demo.c",
            "--tag-mode",
            "sideband",
            "--link",
            "--cflag=-O0",
            "--cflag=-g",
            "--load-address",
            "0x80200000",
        ])
        .unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        let options = args.options();
        assert_eq!(options.source, Some(PathBuf::from("demo.c")));
        assert_eq!(options.tag_mode, Some(TagMode::Sideband));
        assert_eq!(options.link, Some(true));
        assert_eq!(options.bundle, None);
        assert_eq!(options.cflags, Some(vec!["-O0".to_string(), "-g".to_string()]));

        let config = BuildConfig::resolve(options).unwrap();
        assert_eq!(config.link.unwrap().load_address, 0x8020_0000);
    }

    #[test]
    fn test_config_file_fills_unset_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rocketfsm.toml");
        std::fs::write(
            &path,
            "out_dir = \"from-file\"\ncompiler = \"clang-18\"\nbundle = true\n",
        )
        .unwrap();

        let args = BuildArgs {
            source: Some(PathBuf::from("demo.c")),
            config: Some(path),
            compiler: Some(PathBuf::from("clang-17")),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.out_dir, PathBuf::from("from-file"));
        assert_eq!(config.compiler, PathBuf::from("clang-17"));
        assert!(config.bundle.is_some());
    }

    #[test]
    fn test_error_report_is_machine_readable() {
        let err = TagInput::select(None, None).unwrap_err();
        let value = serde_json::to_value(ErrorReport::from(&err)).unwrap();
        assert_eq!(value["kind"], "UsageError");
        assert_eq!(value["exitCode"], 2);
        assert!(value["message"].as_str().unwrap().contains("no tag input"));

        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("short.bin");
        std::fs::write(&bin, [1u8, 0, 0, 0, 2]).unwrap();
        let code = cmd_check(
            None,
            Path::new("/nonexistent/default.json"),
            None,
            Some(bin),
            true,
        )
        .unwrap();
        assert_eq!(code, ExitCode::from(2));
    }

    #[test]
    fn test_print_validation_on_failure() {
        let result = rocketfsm_core::validate(
            &["BOOT".to_string(), "RUN".to_string()],
            &rocketfsm_core::Policy::builtin().unwrap(),
        );
        assert!(!result.passed());
        print_validation(&result);
    }
}
