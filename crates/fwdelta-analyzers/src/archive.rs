//! Application package comparison.
//!
//! Both packages are expanded into their own scratch directories, the two
//! trees are diffed file by file into [`ChangeRecord`]s, and every internal
//! path is tiered. Scratch directories are released on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fwdelta_core::{ChangeKind, ChangeRecord, FwdeltaError, LineCount, TierConfig, ToolConfig};
use fwdelta_difflens::tier::TierClassifier;
use similar::{ChangeTag, TextDiff};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::digest::{AnalysisDigest, ArchiveDigest};
use crate::dispatch::{AnalysisContext, AnalysisOutcome, Analyzer, ArtifactPair};
use crate::tools::ToolRunner;

/// Bytes inspected for NUL when deciding whether content is text.
const BINARY_SNIFF_LEN: usize = 8000;

/// Scratch directory removed when dropped.
///
/// Removal failures are logged and never escalated.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh directory under the system temp dir.
    pub fn new(prefix: &str) -> Result<Self, FwdeltaError> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Location of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(path = %self.path.display(), "failed to remove scratch directory: {e}");
            }
        }
    }
}

/// Expands a package into a directory.
pub trait ArchiveExpander: Send + Sync {
    /// Write the contents of `archive` below `dest`.
    fn expand(&self, archive: &Path, dest: &Path) -> Result<(), FwdeltaError>;
}

/// Plain zip expansion.
///
/// Entries whose names escape the destination are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExpander;

impl ArchiveExpander for ZipExpander {
    fn expand(&self, archive: &Path, dest: &Path) -> Result<(), FwdeltaError> {
        let archive_error = |e: zip::result::ZipError| {
            FwdeltaError::Archive(format!("{}: {e}", archive.display()))
        };
        let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(archive_error)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(archive_error)?;
            let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
                tracing::warn!(entry = entry.name(), "skipping archive entry outside the root");
                continue;
            };
            let target = dest.join(rel);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    }
}

/// Produces a deep content diff of two files of one type.
pub trait ContentDiffer: Send + Sync {
    /// Unified diff text of `old` against `new`.
    fn diff(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError>;
}

/// Diffs bytecode files through their `dexdump` disassembly.
#[derive(Debug, Clone)]
pub struct DexdumpDiffer {
    program: String,
    runner: ToolRunner,
}

impl DexdumpDiffer {
    /// Create a differ from the `[tools]` table.
    pub fn from_config(config: &ToolConfig) -> Self {
        Self {
            program: config.dexdump.clone(),
            runner: ToolRunner::from_config(config),
        }
    }
}

impl ContentDiffer for DexdumpDiffer {
    fn diff(&self, old: &Path, new: &Path) -> Result<String, FwdeltaError> {
        let old_text = self.runner.run(&self.program, ["-d", &*old.to_string_lossy()])?;
        let new_text = self.runner.run(&self.program, ["-d", &*new.to_string_lossy()])?;
        Ok(unified_diff(&old_text, &new_text))
    }
}

fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("old", "new")
        .to_string()
}

/// Returns `true` if `data` looks like text.
fn is_text(data: &[u8]) -> bool {
    !data[..data.len().min(BINARY_SNIFF_LEN)].contains(&0) && std::str::from_utf8(data).is_ok()
}

fn line_count(data: &[u8]) -> LineCount {
    if is_text(data) {
        LineCount::Lines(String::from_utf8_lossy(data).lines().count() as u64)
    } else {
        LineCount::NonText
    }
}

fn numstat(old: &[u8], new: &[u8]) -> (LineCount, LineCount) {
    if !is_text(old) || !is_text(new) {
        return (LineCount::NonText, LineCount::NonText);
    }
    let old = String::from_utf8_lossy(old);
    let new = String::from_utf8_lossy(new);
    let diff = TextDiff::from_lines(old.as_ref(), new.as_ref());
    let (mut added, mut deleted) = (0, 0);
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => deleted += 1,
            ChangeTag::Equal => {}
        }
    }
    (LineCount::Lines(added), LineCount::Lines(deleted))
}

fn list_files(root: &Path) -> Result<BTreeMap<String, PathBuf>, FwdeltaError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(key, entry.path().to_path_buf());
    }
    Ok(files)
}

/// Diff two directory trees into per-file change records.
///
/// Identical files produce no record. Line counts follow the diff-summary
/// convention: non-text content on either side is [`LineCount::NonText`].
pub fn diff_trees(old_root: &Path, new_root: &Path) -> Result<Vec<ChangeRecord>, FwdeltaError> {
    let old_files = list_files(old_root)?;
    let new_files = list_files(new_root)?;
    let paths: BTreeSet<&String> = old_files.keys().chain(new_files.keys()).collect();

    let mut records = Vec::new();
    for path in paths {
        let record = match (old_files.get(path), new_files.get(path)) {
            (Some(old), Some(new)) => {
                let old = std::fs::read(old)?;
                let new = std::fs::read(new)?;
                if old == new {
                    continue;
                }
                let (added, deleted) = numstat(&old, &new);
                ChangeRecord::modified(path.as_str(), added, deleted)
            }
            (Some(old), None) => {
                let lines = line_count(&std::fs::read(old)?);
                let added = if lines.is_non_text() { LineCount::NonText } else { LineCount::Lines(0) };
                ChangeRecord::deleted(path.as_str(), added, lines)
            }
            (None, Some(new)) => {
                let lines = line_count(&std::fs::read(new)?);
                let deleted = if lines.is_non_text() { LineCount::NonText } else { LineCount::Lines(0) };
                ChangeRecord::added(path.as_str(), lines, deleted)
            }
            (None, None) => continue,
        };
        records.push(record);
    }
    Ok(records)
}

fn is_bytecode(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with("classes") && name.ends_with(".dex")
}

/// Compares two versions of an application package.
#[derive(Clone)]
pub struct ArchiveAnalyzer {
    expander: Arc<dyn ArchiveExpander>,
    classifier: TierClassifier,
    dex_differ: Option<Arc<dyn ContentDiffer>>,
}

impl ArchiveAnalyzer {
    /// Create an analyzer from explicit collaborators.
    pub fn new(
        expander: Arc<dyn ArchiveExpander>,
        classifier: TierClassifier,
        dex_differ: Option<Arc<dyn ContentDiffer>>,
    ) -> Self {
        Self {
            expander,
            classifier,
            dex_differ,
        }
    }

    /// Zip expansion, configured tiers, and `dexdump` bytecode diffs.
    pub fn from_config(tools: &ToolConfig, tiers: &TierConfig) -> Self {
        Self::new(
            Arc::new(ZipExpander),
            TierClassifier::from_config(tiers),
            Some(Arc::new(DexdumpDiffer::from_config(tools))),
        )
    }

    /// Compare two package files.
    ///
    /// # Errors
    ///
    /// Propagates expansion and I/O failures. Bytecode diff failures are
    /// logged and leave that entry out of `dex_diffs`.
    pub fn compare(&self, old: &Path, new: &Path) -> Result<ArchiveDigest, FwdeltaError> {
        let old_dir = ScratchDir::new("apk1_")?;
        let new_dir = ScratchDir::new("apk2_")?;
        self.expander.expand(old, old_dir.path())?;
        self.expander.expand(new, new_dir.path())?;

        let records = diff_trees(old_dir.path(), new_dir.path())?;
        let tiered = self.classifier.classify_records(&records);

        let mut dex_diffs = BTreeMap::new();
        if let Some(differ) = &self.dex_differ {
            let modified_bytecode = records
                .iter()
                .filter(|r| r.change_kind() == ChangeKind::Modified && is_bytecode(r.new_path()));
            for record in modified_bytecode {
                let path = record.new_path();
                match differ.diff(&old_dir.path().join(path), &new_dir.path().join(path)) {
                    Ok(diff) => {
                        dex_diffs.insert(path.to_string(), diff);
                    }
                    Err(e) => tracing::warn!(path, "bytecode diff failed: {e}"),
                }
            }
        }

        Ok(ArchiveDigest::from_tiers(tiered, dex_diffs))
    }
}

/// One-line description of an archive digest.
pub fn describe(digest: &ArchiveDigest) -> String {
    let counts: Vec<String> = digest
        .tiered_changes
        .iter()
        .map(|(tier, records)| format!("{tier}: {}", records.len()))
        .collect();
    let verdict = if digest.has_meaningful_change {
        "meaningful change"
    } else {
        "no meaningful change"
    };
    if counts.is_empty() {
        verdict.to_string()
    } else {
        format!("{verdict} ({})", counts.join(", "))
    }
}

impl Analyzer for ArchiveAnalyzer {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn analyze(&self, pair: &ArtifactPair, _ctx: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError> {
        let digest = self.compare(&pair.old, &pair.new)?;
        let summary = describe(&digest);
        Ok(AnalysisOutcome {
            digest: AnalysisDigest::Archive(digest),
            summary,
        })
    }
}
