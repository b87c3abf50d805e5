//! Binary and shared-library comparison.
//!
//! Parses the comparator's whole-file and per-function reports, compares
//! hardening properties, and attaches service-manifest context.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use fwdelta_core::{FwdeltaError, ToolConfig};
use regex::Regex;

use crate::digest::{AnalysisDigest, BinaryDigest, FunctionSummary};
use crate::dispatch::{AnalysisContext, AnalysisOutcome, Analyzer, ArtifactPair};
use crate::hardening::HardeningDiff;
use crate::tools::{BinaryComparator, Checksec, HardeningInspector, Radiff2};

static SIMILARITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"similarity:\s+([0-9.]+)\s+distance:\s+(\d+)").expect("similarity regex is valid")
});

/// Status column of a per-function line: `| STATUS (similarity)`.
static FUNCTION_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\|\s*(UNMATCH|MATCH|NEW)\b(?:\s*\((\d+(?:\.\d+)?)\))?")
        .expect("function status regex is valid")
});

/// Extract `(similarity, distance)` from a whole-file comparison report.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::binary::parse_similarity;
///
/// let out = "similarity: 0.982\ndistance: 311\n";
/// assert_eq!(parse_similarity(out), Some((0.982, 311)));
/// assert_eq!(parse_similarity("nothing here"), None);
/// ```
pub fn parse_similarity(report: &str) -> Option<(f64, u64)> {
    let caps = SIMILARITY_RE.captures(report)?;
    let similarity = caps.get(1)?.as_str().parse().ok()?;
    let distance = caps.get(2)?.as_str().parse().ok()?;
    Some((similarity, distance))
}

/// Summarize a per-function report.
///
/// Only lines with a `MATCH`, `UNMATCH` or `NEW` status column count; the
/// token must follow a `|` separator, so function names never match. `NEW`
/// functions are never counted as changed. Other functions are changed when
/// the similarity after the status is below 1.0; a missing annotation means
/// identical.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::binary::summarize_functions;
///
/// let report = "\
/// sym.main 40 0x1000 | MATCH (1.000000) | 0x1000 40 sym.main
/// sym.init 12 0x1100 | UNMATCH (0.400000) | 0x1100 14 sym.init
/// sym.fresh 9 0x1200 | NEW (0.000000)
/// ";
/// let s = summarize_functions(report);
/// assert_eq!(s.total_functions, 3);
/// assert_eq!(s.identical_functions, 1);
/// assert_eq!(s.changed_unmatched, 1);
/// assert_eq!(s.new_functions, 1);
/// ```
pub fn summarize_functions(report: &str) -> FunctionSummary {
    let mut summary = FunctionSummary::default();

    for line in report.lines() {
        let Some(caps) = FUNCTION_STATUS_RE.captures(line) else {
            continue;
        };
        summary.total_functions += 1;

        let status = caps.get(1).map_or("", |m| m.as_str());
        if status == "NEW" {
            summary.new_functions += 1;
            continue;
        }

        let similarity = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(1.0);

        if similarity < 1.0 {
            summary.changed_functions += 1;
            if status == "UNMATCH" {
                summary.changed_unmatched += 1;
            } else {
                summary.changed_matched += 1;
            }
        } else {
            summary.identical_functions += 1;
        }
    }

    summary
}

/// Compares two versions of an ELF binary.
#[derive(Clone)]
pub struct BinaryAnalyzer {
    comparator: Arc<dyn BinaryComparator>,
    inspector: Arc<dyn HardeningInspector>,
}

impl BinaryAnalyzer {
    /// Create an analyzer from explicit tool implementations.
    pub fn new(comparator: Arc<dyn BinaryComparator>, inspector: Arc<dyn HardeningInspector>) -> Self {
        Self {
            comparator,
            inspector,
        }
    }

    /// Create an analyzer backed by `radiff2` and `checksec`.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(
            Arc::new(Radiff2::from_config(config)),
            Arc::new(Checksec::from_config(config)),
        )
    }

    /// Compare two binaries without service context.
    ///
    /// # Errors
    ///
    /// Propagates any comparator or inspector failure.
    pub fn compare(&self, old: &Path, new: &Path) -> Result<BinaryDigest, FwdeltaError> {
        let similarity = self.comparator.similarity_report(old, new)?;
        let (similarity_score, edit_distance) = match parse_similarity(&similarity) {
            Some((s, d)) => (Some(s), Some(d)),
            None => {
                tracing::warn!(path = %new.display(), "comparator reported no similarity");
                (None, None)
            }
        };

        let functions = summarize_functions(&self.comparator.function_report(old, new)?);

        let old_props = self.inspector.inspect(old)?;
        let new_props = self.inspector.inspect(new)?;

        Ok(BinaryDigest {
            similarity_score,
            edit_distance,
            functions,
            hardening_comparison: HardeningDiff::compare(&old_props, &new_props),
            ..BinaryDigest::default()
        })
    }

    /// Compare two binaries and attach service-manifest context for `path`.
    pub(crate) fn compare_in_context(
        &self,
        path: &str,
        old: &Path,
        new: &Path,
        ctx: &AnalysisContext,
    ) -> Result<BinaryDigest, FwdeltaError> {
        let mut digest = self.compare(old, new)?;
        if let Some(meta) = ctx.service_metadata_for(path) {
            digest.mentioned_in_service_manifest = true;
            digest.service_metadata = Some(meta.clone());
        }
        Ok(digest)
    }
}

/// One-line description of a binary digest.
pub fn describe(digest: &BinaryDigest) -> String {
    let f = &digest.functions;
    let mut parts = Vec::new();
    match digest.similarity_score {
        Some(s) => parts.push(format!("similarity {s:.3}")),
        None => parts.push("similarity n/a".to_string()),
    }
    parts.push(format!(
        "{}/{} functions changed ({} matched, {} unmatched), {} new",
        f.changed_functions, f.total_functions, f.changed_matched, f.changed_unmatched, f.new_functions
    ));
    parts.push(digest.hardening_comparison.to_string());
    if digest.is_trusted_execution_binary {
        parts.push("trusted app".to_string());
    }
    if digest.mentioned_in_service_manifest {
        parts.push("service".to_string());
    }
    parts.join("; ")
}

impl Analyzer for BinaryAnalyzer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn analyze(&self, pair: &ArtifactPair, ctx: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError> {
        let digest = self.compare_in_context(&pair.path, &pair.old, &pair.new, ctx)?;
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

    use super::*;
    use crate::digest::ServiceMetadata;

    struct StubComparator {
        similarity: String,
        functions: String,
    }

    impl BinaryComparator for StubComparator {
        fn similarity_report(&self, _: &Path, _: &Path) -> Result<String, FwdeltaError> {
            Ok(self.similarity.clone())
        }
        fn function_report(&self, _: &Path, _: &Path) -> Result<String, FwdeltaError> {
            Ok(self.functions.clone())
        }
    }

    struct StubInspector;

    impl HardeningInspector for StubInspector {
        fn inspect(&self, binary: &Path) -> Result<BTreeMap<String, String>, FwdeltaError> {
            let nx = if binary.ends_with("old") { "yes" } else { "no" };
            Ok(BTreeMap::from([("nx".to_string(), nx.to_string())]))
        }
    }

    struct FailingInspector;

    impl HardeningInspector for FailingInspector {
        fn inspect(&self, _: &Path) -> Result<BTreeMap<String, String>, FwdeltaError> {
            Err(FwdeltaError::Tool {
                tool: "checksec".into(),
                message: "exit status: 1".into(),
            })
        }
    }

    fn analyzer(inspector: Arc<dyn HardeningInspector>) -> BinaryAnalyzer {
        BinaryAnalyzer::new(
            Arc::new(StubComparator {
                similarity: "similarity: 0.750 distance: 42".into(),
                functions: "a | MATCH (0.5) |\nb | MATCH (1.0) |\nc | NEW (0.2)\n".into(),
            }),
            inspector,
        )
    }

    #[test]
    fn new_function_never_changed() {
        let s = summarize_functions("sym.x | NEW (0.300000)\nsym.y | NEW\n");
        assert_eq!(s.new_functions, 2);
        assert_eq!(s.changed_functions, 0);
        assert_eq!(s.total_functions, 2);
    }

    #[test]
    fn unmatch_counts_as_changed_unmatched_only() {
        let s = summarize_functions("fcn.0040 | UNMATCH (0.40) | fcn.0041");
        assert_eq!(s.changed_functions, 1);
        assert_eq!(s.changed_unmatched, 1);
        assert_eq!(s.changed_matched, 0);
    }

    #[test]
    fn missing_annotation_means_identical() {
        let s = summarize_functions("sym.a | MATCH |\nsym.b | UNMATCH\n");
        assert_eq!(s.identical_functions, 2);
        assert_eq!(s.changed_functions, 0);
    }

    #[test]
    fn lines_without_tokens_are_ignored() {
        let s = summarize_functions("header line\nMATCHES are not tokens\n\n");
        assert_eq!(s, FunctionSummary::default());
    }

    #[test]
    fn status_read_from_column_not_name() {
        let s = summarize_functions(
            "sym.NEW 12 0x1000 | MATCH (0.500000) | 0x1000 12 sym.NEW\n\
             sym.UNMATCH_handler 8 0x2000 | MATCH (1.000000) | 0x2000 8 sym.UNMATCH_handler\n\
             fcn.MATCH(0.1) 4 0x3000 | UNMATCH (0.900000) | 0x3000 4 fcn.MATCH(0.1)\n",
        );
        assert_eq!(s.total_functions, 3);
        assert_eq!(s.new_functions, 0);
        assert_eq!(s.changed_matched, 1);
        assert_eq!(s.changed_unmatched, 1);
        assert_eq!(s.identical_functions, 1);
    }

    #[test]
    fn similarity_on_one_line() {
        assert_eq!(
            parse_similarity("similarity: 1.000 distance: 0"),
            Some((1.0, 0))
        );
    }

    #[test]
    fn compare_builds_full_digest() {
        let a = analyzer(Arc::new(StubInspector));
        let digest = a.compare(Path::new("/x/old"), Path::new("/x/new")).unwrap();
        assert_eq!(digest.similarity_score, Some(0.75));
        assert_eq!(digest.edit_distance, Some(42));
        assert_eq!(digest.functions.total_functions, 3);
        assert_eq!(digest.functions.changed_matched, 1);
        assert_eq!(digest.functions.identical_functions, 1);
        assert_eq!(digest.hardening_comparison.regressions(), 1);
        assert!(!digest.is_fully_identical());
    }

    #[test]
    fn inspector_failure_propagates() {
        let a = analyzer(Arc::new(FailingInspector));
        assert!(a.compare(Path::new("old"), Path::new("new")).is_err());
    }

    #[test]
    fn service_context_is_attached() {
        let a = analyzer(Arc::new(StubInspector));
        let mut ctx = AnalysisContext::default();
        ctx.services.insert(
            "/system/bin/vold".into(),
            ServiceMetadata {
                user: Some("root".into()),
                ..ServiceMetadata::default()
            },
        );
        let pair = ArtifactPair::new("system/bin/vold", "/x/old", "/x/new");
        let outcome = a.analyze(&pair, &ctx).unwrap();
        let digest = outcome.digest.as_binary().unwrap();
        assert!(digest.mentioned_in_service_manifest);
        assert!(digest.runs_as_root());
        assert!(outcome.summary.contains("similarity 0.750"));
    }
}
