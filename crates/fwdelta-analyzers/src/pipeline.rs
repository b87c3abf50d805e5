//! End-to-end digest pipeline.
//!
//! Diff summary text goes in; an aggregated change tree, per-artifact
//! digests and tier buckets come out. Analyzer runs are independent per
//! artifact and fan out over rayon when enabled. Results are merged in
//! input order, so the digest keys do not depend on scheduling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fwdelta_core::{ChangeRecord, FwdeltaConfig, FwdeltaError, Tier};
use fwdelta_difflens::filter::{AnalysisFilter, SkippedRecord};
use fwdelta_difflens::parser::{parse_summary, SkippedLine};
use fwdelta_difflens::tier::TierClassifier;
use fwdelta_difflens::tree::ChangeTree;
use rayon::prelude::*;

use crate::aggregator::DigestCollection;
use crate::dispatch::{AnalysisContext, ArtifactKind, ArtifactPair, DeepAnalyzer, Dispatched};

/// Read a diff summary file.
///
/// # Errors
///
/// Returns [`FwdeltaError::FileNotFound`] for a missing file and
/// [`FwdeltaError::Io`] for any other read failure.
pub fn read_summary(path: &Path) -> Result<String, FwdeltaError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FwdeltaError::FileNotFound(path.to_path_buf()),
        _ => FwdeltaError::Io(e),
    })
}

/// The two extracted snapshot roots the summary paths are relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRoots {
    /// Root of the old snapshot.
    pub old: PathBuf,
    /// Root of the new snapshot.
    pub new: PathBuf,
}

impl SnapshotRoots {
    /// Create a pair of roots.
    pub fn new(old: impl Into<PathBuf>, new: impl Into<PathBuf>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    /// Resolve both sides of a record on disk.
    pub fn resolve(&self, record: &ChangeRecord) -> ArtifactPair {
        let new_path = record.new_path();
        let old_path = record.old_path().unwrap_or(new_path);
        ArtifactPair::new(
            new_path,
            self.old.join(old_path.trim_start_matches('/')),
            self.new.join(new_path.trim_start_matches('/')),
        )
    }
}

/// Everything one pipeline run produces.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// Aggregated change tree with analysis summaries on analyzed leaves.
    pub tree: ChangeTree,
    /// Per-artifact digests.
    pub digests: DigestCollection,
    /// Top-level records bucketed by tier.
    pub tiers: BTreeMap<Tier, Vec<ChangeRecord>>,
    /// Malformed summary lines.
    pub skipped_lines: Vec<SkippedLine>,
    /// Records not handed to deep analysis.
    pub not_analyzed: Vec<SkippedRecord>,
}

/// Parses, classifies, analyzes and aggregates one diff summary.
#[derive(Clone)]
pub struct DigestPipeline {
    deep: DeepAnalyzer,
    filter: AnalysisFilter,
    classifier: TierClassifier,
    key_depth: usize,
    parallel: bool,
    root_key: Option<String>,
}

impl DigestPipeline {
    /// Create a pipeline around `deep` with default settings.
    pub fn new(deep: DeepAnalyzer) -> Self {
        let config = FwdeltaConfig::default();
        Self {
            deep,
            filter: AnalysisFilter::from_config(&config.analysis),
            classifier: TierClassifier::from_config(&config.tiers),
            key_depth: config.analysis.digest_key_depth,
            parallel: config.analysis.parallel,
            root_key: None,
        }
    }

    /// Create a pipeline with the configured analyzers and settings.
    pub fn from_config(config: &FwdeltaConfig) -> Self {
        Self {
            deep: DeepAnalyzer::from_config(config),
            filter: AnalysisFilter::from_config(&config.analysis),
            classifier: TierClassifier::from_config(&config.tiers),
            key_depth: config.analysis.digest_key_depth,
            parallel: config.analysis.parallel,
            root_key: None,
        }
    }

    /// Hang the whole tree under `key`.
    pub fn with_root_key(mut self, key: impl Into<String>) -> Self {
        self.root_key = Some(key.into());
        self
    }

    /// Enable or disable parallel analyzer dispatch.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn empty_tree(&self) -> ChangeTree {
        match &self.root_key {
            Some(key) => ChangeTree::with_root_key(key.clone()),
            None => ChangeTree::new(),
        }
    }

    /// Build the aggregated tree and tier buckets without deep analysis.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_analyzers::dispatch::{DeepAnalyzer, Detector};
    /// use fwdelta_analyzers::pipeline::DigestPipeline;
    ///
    /// let pipeline = DigestPipeline::new(DeepAnalyzer::new(Detector::default()));
    /// let out = pipeline.summarize("3\t1\tsystem/bin/a\n2\t0\tsystem/bin/b\nbad\n");
    /// assert_eq!(out.tree.dir("system").unwrap().totals(), (5, 1));
    /// assert_eq!(out.skipped_lines.len(), 1);
    /// assert!(out.digests.is_empty());
    /// ```
    pub fn summarize(&self, input: &str) -> PipelineOutput {
        let parsed = parse_summary(input);
        let mut tree = self.empty_tree();
        for record in &parsed.records {
            tree.insert(record);
        }
        let (added, deleted) = tree.aggregate();
        tracing::info!(
            records = parsed.records.len(),
            added,
            deleted,
            "built change tree"
        );

        PipelineOutput {
            tree,
            digests: DigestCollection::new(self.key_depth),
            tiers: self.classifier.classify_records(&parsed.records),
            skipped_lines: parsed.skipped,
            not_analyzed: Vec::new(),
        }
    }

    /// Run the full pipeline against extracted snapshots.
    ///
    /// Never fails: per-artifact problems degrade that artifact's digest.
    pub fn run(&self, input: &str, roots: &SnapshotRoots, ctx: &AnalysisContext) -> PipelineOutput {
        let parsed = parse_summary(input);
        let mut tree = self.empty_tree();
        for record in &parsed.records {
            tree.insert(record);
        }

        let selection = self.filter.filter(&parsed.records);
        let pairs: Vec<ArtifactPair> = selection.kept.iter().map(|r| roots.resolve(r)).collect();
        tracing::info!(
            artifacts = pairs.len(),
            not_analyzed = selection.skipped.len(),
            parallel = self.parallel,
            "dispatching deep analysis"
        );

        let dispatch = |pair: &ArtifactPair| self.deep.dispatch(pair, ctx);
        let results: Vec<Dispatched> = if self.parallel {
            pairs.par_iter().map(dispatch).collect()
        } else {
            pairs.iter().map(dispatch).collect()
        };

        let mut digests = DigestCollection::new(self.key_depth);
        for (pair, result) in pairs.iter().zip(results) {
            if result.kind == Some(ArtifactKind::Plain) {
                continue;
            }
            if !tree.set_analysis(&pair.path, result.outcome.summary) {
                tracing::debug!(path = %pair.path, "no tree leaf for analyzed artifact");
            }
            digests.insert(&pair.path, result.outcome.digest);
        }

        tree.aggregate();

        PipelineOutput {
            tree,
            digests,
            tiers: self.classifier.classify_records(&parsed.records),
            skipped_lines: parsed.skipped,
            not_analyzed: selection.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fwdelta_core::FwdeltaError;

    use super::*;
    use crate::digest::AnalysisDigest;
    use crate::dispatch::{AnalysisOutcome, Analyzer, Detector};

    struct EchoAnalyzer;

    impl Analyzer for EchoAnalyzer {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn analyze(&self, pair: &ArtifactPair, _: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError> {
            Ok(AnalysisOutcome {
                digest: AnalysisDigest::LineCountOnly {
                    reason: pair.old.display().to_string(),
                },
                summary: format!("echo {}", pair.path),
            })
        }
    }

    fn pipeline() -> DigestPipeline {
        let mut deep = DeepAnalyzer::new(Detector::default());
        deep.register(ArtifactKind::Certificate, Arc::new(EchoAnalyzer));
        DigestPipeline::new(deep)
    }

    #[test]
    fn resolve_uses_old_path_for_renames() {
        let roots = SnapshotRoots::new("/a", "/b");
        let rec = ChangeRecord::renamed(
            "etc/cacerts/old.0",
            "etc/cacerts/new.0",
            fwdelta_core::LineCount::Lines(1),
            fwdelta_core::LineCount::Lines(1),
        );
        let pair = roots.resolve(&rec);
        assert_eq!(pair.old, PathBuf::from("/a/etc/cacerts/old.0"));
        assert_eq!(pair.new, PathBuf::from("/b/etc/cacerts/new.0"));
        assert_eq!(pair.path, "etc/cacerts/new.0");
    }

    #[test]
    fn run_analyzes_only_comparable_non_plain_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for side in ["old", "new"] {
            let certs = dir.path().join(side).join("etc/cacerts");
            std::fs::create_dir_all(&certs).unwrap();
            std::fs::write(certs.join("a.0"), format!("{side} cert")).unwrap();
            std::fs::write(dir.path().join(side).join("etc/hosts"), "127.0.0.1\n").unwrap();
        }
        let input = "1\t1\tetc/cacerts/a.0\n1\t0\tetc/hosts\n4\t0\tetc/cacerts/b.0 => /dev/null\n";
        let roots = SnapshotRoots::new(dir.path().join("old"), dir.path().join("new"));

        for parallel in [true, false] {
            let out = pipeline()
                .with_parallel(parallel)
                .run(input, &roots, &AnalysisContext::default());
            assert_eq!(out.digests.len(), 1);
            assert!(out.digests.get("etc/cacerts/a.0").is_some());
            assert_eq!(
                out.tree.leaf("etc/cacerts/a.0").unwrap().analysis.as_deref(),
                Some("echo etc/cacerts/a.0")
            );
            assert_eq!(out.tree.leaf("etc/hosts").unwrap().analysis, None);
            assert_eq!(out.not_analyzed.len(), 1);
            assert_eq!(out.tree.root().totals(), (6, 1));
        }
    }

    #[test]
    fn root_key_wraps_tree() {
        let out = pipeline()
            .with_root_key("build-42")
            .summarize("1\t0\tsystem/bin/a\n");
        let json = serde_json::to_value(&out.tree).unwrap();
        assert_eq!(json["build-42"]["system"]["bin"]["a"]["added"], 1);
    }

    #[test]
    fn read_summary_reports_missing_file() {
        let err = read_summary(Path::new("/nonexistent/summary.txt")).unwrap_err();
        assert!(matches!(err, FwdeltaError::FileNotFound(_)));
    }
}
