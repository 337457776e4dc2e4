//! Command-line construction for each external tool.

use std::path::Path;

use crate::config::{BuildConfig, LinkConfig};
use crate::runner::{Tool, ToolInvocation};

fn target_flags(config: &BuildConfig) -> Vec<String> {
    vec![
        format!("--target={}", config.target.triple),
        format!("-march={}", config.target.arch),
        format!("-mabi={}", config.target.abi),
    ]
}

/// `clang --target=... -S -o <stem>.s <source>`
pub fn compile_assembly(config: &BuildConfig) -> ToolInvocation {
    let out = &config.artifacts.assembly;
    ToolInvocation::new(Tool::Compiler, &config.compiler)
        .args(target_flags(config))
        .args(config.cflags.iter().cloned())
        .arg("-S")
        .arg("-o")
        .arg(out.to_string_lossy())
        .arg(config.source.to_string_lossy())
        .output(out)
}

/// `clang --target=... -c -o <stem>.o <source>`
pub fn compile_object(config: &BuildConfig) -> ToolInvocation {
    let out = &config.artifacts.object;
    ToolInvocation::new(Tool::Compiler, &config.compiler)
        .args(target_flags(config))
        .args(config.cflags.iter().cloned())
        .arg("-c")
        .arg("-o")
        .arg(out.to_string_lossy())
        .arg(config.source.to_string_lossy())
        .output(out)
}

/// `llvm-objcopy -O binary --only-section=.fsm_trace <obj> <bin>`
pub fn dump_section(config: &BuildConfig) -> ToolInvocation {
    let out = &config.artifacts.sideband_bin;
    ToolInvocation::new(Tool::SectionDump, &config.objcopy)
        .args(["-O", "binary"])
        .arg(format!("--only-section={}", config.sideband_section))
        .arg(config.artifacts.object.to_string_lossy())
        .arg(out.to_string_lossy())
        .output(out)
}

/// Arguments handed to the linker driver, recorded verbatim in the bundle.
pub fn link_arguments(config: &BuildConfig, link: &LinkConfig) -> Vec<String> {
    let mut args = target_flags(config);
    args.extend(link.args.iter().cloned());
    args.push(format!("-Wl,-Ttext=0x{:x}", link.load_address));
    args.push("-o".to_string());
    args.push(config.artifacts.executable.to_string_lossy().into_owned());
    args.push(config.artifacts.object.to_string_lossy().into_owned());
    args
}

/// Link the object into `<stem>.elf` at the configured load address.
pub fn link(config: &BuildConfig, link: &LinkConfig) -> ToolInvocation {
    ToolInvocation::new(Tool::Linker, &link.linker)
        .args(link_arguments(config, link))
        .output(&config.artifacts.executable)
}

/// `tar -cf <archive> <entries...>` run inside the bundle directory.
///
/// `entries` must already be sorted by name.
pub fn archive(archiver: &Path, bundle_dir: &Path, archive: &Path, entries: &[String]) -> ToolInvocation {
    ToolInvocation::new(Tool::Archiver, archiver)
        .arg("-cf")
        .arg(archive.to_string_lossy())
        .args(entries.iter().cloned())
        .current_dir(bundle_dir)
        .output(archive)
}
