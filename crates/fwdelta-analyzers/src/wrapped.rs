//! Trusted-application containers wrapping an ELF image.
//!
//! Vendors prefix trusted-execution binaries with their own header. The
//! analyzer cuts everything before the first ELF magic and hands the bare
//! images to the [`BinaryAnalyzer`].

use std::io::Write;
use std::path::Path;

use fwdelta_core::FwdeltaError;
use tempfile::NamedTempFile;

use crate::binary::{describe, BinaryAnalyzer};
use crate::digest::AnalysisDigest;
use crate::dispatch::{AnalysisContext, AnalysisOutcome, Analyzer, ArtifactPair};

/// The four-byte ELF signature.
pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Return the slice of `data` starting at the first ELF magic.
///
/// # Errors
///
/// Returns [`FwdeltaError::Format`] if no ELF magic is present.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::wrapped::strip_to_elf;
///
/// let wrapped = b"MCLF\x00\x01\x02\x7fELF\x02\x01";
/// assert_eq!(strip_to_elf(wrapped).unwrap(), b"\x7fELF\x02\x01");
/// assert!(strip_to_elf(b"MCLF no image").is_err());
/// ```
pub fn strip_to_elf(data: &[u8]) -> Result<&[u8], FwdeltaError> {
    data.windows(ELF_MAGIC.len())
        .position(|w| w == ELF_MAGIC)
        .map(|start| &data[start..])
        .ok_or_else(|| FwdeltaError::Format("no embedded ELF signature found".into()))
}

/// Unwraps both sides and delegates to a [`BinaryAnalyzer`].
#[derive(Clone)]
pub struct WrappedTrustedAppAnalyzer {
    binary: BinaryAnalyzer,
}

impl WrappedTrustedAppAnalyzer {
    /// Create an analyzer delegating to `binary`.
    pub fn new(binary: BinaryAnalyzer) -> Self {
        Self { binary }
    }
}

/// Write the bare ELF image of `path` into a fresh temporary file.
///
/// The file is removed when the returned handle drops.
fn unwrap_to_temp(path: &Path) -> Result<NamedTempFile, FwdeltaError> {
    let data = std::fs::read(path)?;
    let elf = strip_to_elf(&data)
        .map_err(|_| FwdeltaError::Format(format!("no embedded ELF signature in {}", path.display())))?;
    let mut file = tempfile::Builder::new().prefix("fwdelta-ta-").tempfile()?;
    file.write_all(elf)?;
    file.flush()?;
    Ok(file)
}

impl Analyzer for WrappedTrustedAppAnalyzer {
    fn name(&self) -> &'static str {
        "wrapped_trusted_app"
    }

    fn analyze(&self, pair: &ArtifactPair, ctx: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError> {
        let old = unwrap_to_temp(&pair.old)?;
        let new = unwrap_to_temp(&pair.new)?;

        let mut digest = self
            .binary
            .compare_in_context(&pair.path, old.path(), new.path(), ctx)?;
        digest.is_trusted_execution_binary = true;

        let summary = describe(&digest);
        Ok(AnalysisOutcome {
            digest: AnalysisDigest::Binary(digest),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::tools::{BinaryComparator, HardeningInspector};

    /// Records the first bytes of every file it is asked to compare.
    #[derive(Default)]
    struct RecordingComparator {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl BinaryComparator for RecordingComparator {
        fn similarity_report(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(std::fs::read(old)?);
            seen.push(std::fs::read(new)?);
            Ok("similarity: 0.5 distance: 9".into())
        }
        fn function_report(&self, _: &Path, _: &Path) -> Result<String, FwdeltaError> {
            Ok("f | UNMATCH (0.2)".into())
        }
    }

    struct EmptyInspector;

    impl HardeningInspector for EmptyInspector {
        fn inspect(&self, _: &Path) -> Result<BTreeMap<String, String>, FwdeltaError> {
            Ok(BTreeMap::new())
        }
    }

    #[test]
    fn strips_header_and_flags_trusted_app() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.ta");
        let new = dir.path().join("new.ta");
        std::fs::write(&old, b"SEC2hdrhdr\x7fELFold-body").unwrap();
        std::fs::write(&new, b"SEC2hdr\x7fELFnew-body").unwrap();

        let comparator = Arc::new(RecordingComparator::default());
        let analyzer = WrappedTrustedAppAnalyzer::new(BinaryAnalyzer::new(
            comparator.clone(),
            Arc::new(EmptyInspector),
        ));
        let pair = ArtifactPair::new("vendor/app/mcRegistry/ta.tlbin", old, new);
        let outcome = analyzer.analyze(&pair, &AnalysisContext::default()).unwrap();

        let digest = outcome.digest.as_binary().unwrap();
        assert!(digest.is_trusted_execution_binary);
        assert_eq!(digest.functions.changed_unmatched, 1);

        let seen = comparator.seen.lock().unwrap();
        assert_eq!(seen[0], b"\x7fELFold-body");
        assert_eq!(seen[1], b"\x7fELFnew-body");
    }

    #[test]
    fn missing_elf_magic_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.ta");
        let new = dir.path().join("new.ta");
        std::fs::write(&old, b"MCLF garbage").unwrap();
        std::fs::write(&new, b"MCLF\x7fELF").unwrap();

        let analyzer = WrappedTrustedAppAnalyzer::new(BinaryAnalyzer::new(
            Arc::new(RecordingComparator::default()),
            Arc::new(EmptyInspector),
        ));
        let pair = ArtifactPair::new("ta.bin", old, new);
        let err = analyzer
            .analyze(&pair, &AnalysisContext::default())
            .unwrap_err();
        assert!(matches!(err, FwdeltaError::Format(_)));
    }
}
