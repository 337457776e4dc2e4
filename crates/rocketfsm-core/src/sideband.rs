//! Sideband artifacts derived from the raw `.fsm_trace` section dump.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FsmError, Result};
use crate::extract::decode_words;

/// Default name of the sideband section emitted by `FSM_TRACE_EMIT_ID`.
pub const DEFAULT_SECTION: &str = ".fsm_trace";

/// JSON description of an extracted sideband stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebandManifest {
    pub section: String,
    pub source_object: PathBuf,
    pub sideband_bin: PathBuf,
    pub word_count: usize,
    pub words: Vec<u32>,
    pub hex_words: Vec<String>,
}

impl SidebandManifest {
    pub fn new(section: &str, source_object: &Path, sideband_bin: &Path, words: Vec<u32>) -> Self {
        Self {
            section: section.to_string(),
            source_object: source_object.to_path_buf(),
            sideband_bin: sideband_bin.to_path_buf(),
            word_count: words.len(),
            hex_words: words.iter().map(|w| format_word(*w)).collect(),
            words,
        }
    }
}

/// `0x` followed by eight lowercase hex digits.
pub fn format_word(word: u32) -> String {
    format!("0x{word:08x}")
}

/// One formatted word per line, newline-terminated.
pub fn render_hex(words: &[u32]) -> String {
    words.iter().map(|w| format_word(*w) + "\n").collect()
}

/// Paths of the files written by [`write_sideband_artifacts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandArtifacts {
    pub hex: PathBuf,
    pub manifest: PathBuf,
    pub words: Vec<u32>,
}

/// Read the raw section dump and write its hex listing and JSON manifest.
pub fn write_sideband_artifacts(
    section: &str,
    object: &Path,
    bin: &Path,
    hex_out: &Path,
    manifest_out: &Path,
) -> Result<SidebandArtifacts> {
    let bytes = std::fs::read(bin).map_err(|e| FsmError::io(bin, e))?;
    let words = decode_words(&bytes)?;

    std::fs::write(hex_out, render_hex(&words)).map_err(|e| FsmError::io(hex_out, e))?;

    let manifest = SidebandManifest::new(section, object, bin, words.clone());
    write_json(manifest_out, &manifest)?;

    Ok(SidebandArtifacts {
        hex: hex_out.to_path_buf(),
        manifest: manifest_out.to_path_buf(),
        words,
    })
}

/// Pretty JSON with a trailing newline.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value).map_err(|e| {
        FsmError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    body.push('\n');
    std::fs::write(path, body).map_err(|e| FsmError::io(path, e))
}
