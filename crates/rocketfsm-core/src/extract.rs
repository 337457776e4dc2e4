//! Tag extraction: turns a compiled artifact into an ordered sequence of
//! symbolic states.
//!
//! Two independent adapters exist and exactly one is used per invocation:
//! - textual `TAG:<STATE>` markers in generated assembly
//! - a raw sideband stream of little-endian 32-bit tag IDs

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{FsmError, Result};
use crate::policy::Policy;

/// Literal prefix of a textual tag marker.
pub const MARKER_PREFIX: &str = "TAG:";

/// Width of one sideband word in bytes.
pub const WORD_BYTES: usize = 4;

/// Ordered list of symbolic states.
pub type TagSequence = Vec<String>;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"TAG:([A-Za-z0-9_]+)").expect("static marker regex"))
}

/// Collect every `TAG:<STATE>` marker in document order.
///
/// Matches are not deduplicated. Content without markers yields an empty
/// sequence; deciding whether that is acceptable is the validator's job.
pub fn extract_from_text(content: &str) -> TagSequence {
    marker_pattern()
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Decode a sideband byte stream into little-endian 32-bit words.
pub fn decode_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % WORD_BYTES != 0 {
        return Err(FsmError::MalformedStream { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(WORD_BYTES)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

/// Encode words back into the sideband wire format.
pub fn encode_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Map a sideband byte stream to symbolic states through `policy.ids`.
///
/// The policy must carry an `ids` table; its absence is reported before any
/// byte is inspected.
pub fn extract_from_sideband(bytes: &[u8], policy: &Policy) -> Result<TagSequence> {
    let table = policy.id_table()?;
    decode_words(bytes)?
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            table
                .get(&value)
                .map(|state| (*state).to_string())
                .ok_or(FsmError::UnknownTagId { value, index })
        })
        .collect()
}

/// Which artifact the tag sequence is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagInput {
    /// Assembly text containing `TAG:` markers.
    Markers(PathBuf),
    /// Raw sideband section dump.
    Sideband(PathBuf),
}

impl TagInput {
    /// Pick the input adapter. Exactly one of the two must be given.
    pub fn select(asm: Option<PathBuf>, sideband: Option<PathBuf>) -> Result<Self> {
        match (asm, sideband) {
            (Some(asm), None) => Ok(TagInput::Markers(asm)),
            (None, Some(bin)) => Ok(TagInput::Sideband(bin)),
            (Some(_), Some(_)) => Err(FsmError::Usage(
                "select exactly one tag input: assembly markers or sideband stream, not both"
                    .to_string(),
            )),
            (None, None) => Err(FsmError::Usage(
                "no tag input given: pass an assembly file or a sideband stream".to_string(),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TagInput::Markers(p) | TagInput::Sideband(p) => p,
        }
    }

    /// Read the artifact and extract its tag sequence.
    pub fn extract(&self, policy: &Policy) -> Result<TagSequence> {
        match self {
            TagInput::Markers(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| FsmError::io(path, e))?;
                Ok(extract_from_text(&content))
            }
            TagInput::Sideband(path) => {
                // ids are checked before the file is touched
                policy.id_table()?;
                let bytes = std::fs::read(path).map_err(|e| FsmError::io(path, e))?;
                extract_from_sideband(&bytes, policy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_policy() -> Policy {
        Policy::from_json(
            r#"{"ids": {"BOOT": 1, "INIT": 2, "RUN": 3, "HALT": 4}}"#,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_text_markers_in_document_order() {
        let asm = "\
main:
    # TAG:BOOT
    addi a0, a0, 1
    # TAG:INIT
    # TAG:RUN
";
        assert_eq!(extract_from_text(asm), vec!["BOOT", "INIT", "RUN"]);
    }

    #[test]
    fn test_multiple_markers_per_line_left_to_right() {
        let asm = "# TAG:BOOT ; TAG:INIT\n# TAG:RUN TAG:RUN\n";
        assert_eq!(extract_from_text(asm), vec!["BOOT", "INIT", "RUN", "RUN"]);
    }

    #[test]
    fn test_marker_stops_at_non_identifier() {
        assert_eq!(extract_from_text("TAG:RUN_2-extra"), vec!["RUN_2"]);
        assert!(extract_from_text("TAG: RUN").is_empty());
    }

    #[test]
    fn test_no_markers_is_empty_not_error() {
        assert!(extract_from_text("main:\n    ret\n").is_empty());
    }

    #[test]
    fn test_sideband_little_endian_mapping() {
        let bytes = [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];
        let seq = extract_from_sideband(&bytes, &id_policy()).unwrap();
        assert_eq!(seq, vec!["BOOT", "INIT", "RUN"]);
    }

    #[test]
    fn test_sideband_rejects_partial_words() {
        for len in [1usize, 2, 3, 5, 6, 7, 9] {
            let bytes = vec![0u8; len];
            match extract_from_sideband(&bytes, &id_policy()) {
                Err(FsmError::MalformedStream { len: got }) => assert_eq!(got, len),
                other => panic!("expected MalformedStream for {len}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_sideband_empty_stream_is_empty_sequence() {
        assert!(extract_from_sideband(&[], &id_policy()).unwrap().is_empty());
    }

    #[test]
    fn test_sideband_unknown_id_reports_value_and_index() {
        let bytes = encode_words(&[1, 2, 0xdead_beef]);
        match extract_from_sideband(&bytes, &id_policy()) {
            Err(FsmError::UnknownTagId { value, index }) => {
                assert_eq!(value, 0xdead_beef);
                assert_eq!(index, 2);
            }
            other => panic!("expected UnknownTagId, got {other:?}"),
        }
    }

    #[test]
    fn test_sideband_requires_ids_before_decoding() {
        // Malformed length must not mask the missing table.
        let err = extract_from_sideband(&[0u8; 5], &Policy::default()).unwrap_err();
        assert!(matches!(err, FsmError::PolicyFormat { .. }));
    }

    #[test]
    fn test_sideband_roundtrip_through_ids() {
        let policy = id_policy();
        let words = [1u32, 2, 3, 3, 3, 4];
        let seq = extract_from_sideband(&encode_words(&words), &policy).unwrap();
        let expected: Vec<String> = words
            .iter()
            .map(|w| {
                policy
                    .ids
                    .iter()
                    .find(|(_, id)| *id == w)
                    .map(|(s, _)| s.clone())
                    .unwrap()
            })
            .collect();
        assert_eq!(seq, expected);
    }

    #[test]
    fn test_select_requires_exactly_one_input() {
        assert!(matches!(
            TagInput::select(None, None),
            Err(FsmError::Usage(_))
        ));
        assert!(matches!(
            TagInput::select(Some("a.s".into()), Some("a.bin".into())),
            Err(FsmError::Usage(_))
        ));
        assert_eq!(
            TagInput::select(Some("a.s".into()), None).unwrap(),
            TagInput::Markers("a.s".into())
        );
        assert_eq!(
            TagInput::select(None, Some("a.bin".into())).unwrap(),
            TagInput::Sideband("a.bin".into())
        );
    }

    #[test]
    fn test_extract_missing_file_is_io_error() {
        let input = TagInput::Markers("/nonexistent/prog.s".into());
        assert!(matches!(
            input.extract(&Policy::default()),
            Err(FsmError::Io { .. })
        ));
    }
}
