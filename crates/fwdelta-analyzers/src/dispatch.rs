//! Artifact detection and analyzer dispatch.
//!
//! The artifact kind is decided from the new side's leading bytes and its
//! path, in a fixed order:
//!
//! 1. trusted-execution wrapper magic at the configured offset
//! 2. entropy of the leading window above the threshold (zip content excluded)
//! 3. ELF executable or shared object
//! 4. package file extension
//! 5. certificate store directory
//! 6. anything else: line counts only
//!
//! Analyzers are registered per kind. Dispatch never fails: analyzer
//! errors degrade the artifact to a line-count-only digest.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fwdelta_core::{AnalysisConfig, FwdeltaConfig, FwdeltaError};
use serde::Serialize;

use crate::archive::ArchiveAnalyzer;
use crate::binary::BinaryAnalyzer;
use crate::cert::CertificateAnalyzer;
use crate::digest::{AnalysisDigest, ServiceMetadata};
use crate::entropy::window_entropy;
use crate::wrapped::{WrappedTrustedAppAnalyzer, ELF_MAGIC};

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

/// Kind of artifact, selecting the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// ELF image behind a vendor trusted-execution header.
    WrappedTrustedApp,
    /// High-entropy content.
    Opaque,
    /// ELF executable or shared object.
    Binary,
    /// Application package.
    Archive,
    /// Certificate store entry.
    Certificate,
    /// No deep analysis.
    Plain,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::WrappedTrustedApp => write!(f, "wrapped trusted app"),
            ArtifactKind::Opaque => write!(f, "opaque"),
            ArtifactKind::Binary => write!(f, "binary"),
            ArtifactKind::Archive => write!(f, "archive"),
            ArtifactKind::Certificate => write!(f, "certificate"),
            ArtifactKind::Plain => write!(f, "plain"),
        }
    }
}

/// One changed artifact with both snapshot versions resolved on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    /// Path relative to the snapshot roots, as in the diff summary.
    pub path: String,
    /// Old version on disk.
    pub old: PathBuf,
    /// New version on disk.
    pub new: PathBuf,
}

impl ArtifactPair {
    /// Create a pair.
    pub fn new(path: impl Into<String>, old: impl Into<PathBuf>, new: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Digest and human-readable summary of one analyzer run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    /// Structured result.
    pub digest: AnalysisDigest,
    /// One-line description attached to the change tree leaf.
    pub summary: String,
}

impl AnalysisOutcome {
    /// A degraded outcome carrying only `reason`.
    pub fn line_count_only(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            summary: format!("line counts only: {reason}"),
            digest: AnalysisDigest::LineCountOnly { reason },
        }
    }
}

/// Read-only inputs shared by every analyzer of one run.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    /// Service-manifest metadata keyed by absolute binary path.
    pub services: BTreeMap<String, ServiceMetadata>,
    /// Shared-library file name to consuming binary paths.
    pub lib_usage: BTreeMap<String, Vec<String>>,
}

impl AnalysisContext {
    /// Create a context from the two lookup maps.
    pub fn new(
        services: BTreeMap<String, ServiceMetadata>,
        lib_usage: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            services,
            lib_usage,
        }
    }

    fn direct_service(&self, path: &str) -> Option<&ServiceMetadata> {
        let path = path.trim_start_matches('/');
        self.services.iter().find_map(|(key, meta)| {
            let key = key.trim_start_matches('/');
            let hit = !key.is_empty()
                && (path == key || path.ends_with(&format!("/{key}")));
            hit.then_some(meta)
        })
    }

    /// Service metadata for the artifact at `path`.
    ///
    /// A binary matches a manifest entry whose path equals it or is a suffix
    /// of it. A shared library with no entry of its own inherits the
    /// metadata of its first consumer (in lexicographic order) that has one.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::BTreeMap;
    /// use fwdelta_analyzers::digest::ServiceMetadata;
    /// use fwdelta_analyzers::dispatch::AnalysisContext;
    ///
    /// let meta = ServiceMetadata { user: Some("root".into()), ..Default::default() };
    /// let ctx = AnalysisContext::new(
    ///     BTreeMap::from([("/system/bin/netd".to_string(), meta.clone())]),
    ///     BTreeMap::from([("libnetd.so".to_string(), vec!["/system/bin/netd".to_string()])]),
    /// );
    /// assert_eq!(ctx.service_metadata_for("fw/system/bin/netd"), Some(&meta));
    /// assert_eq!(ctx.service_metadata_for("system/lib64/libnetd.so"), Some(&meta));
    /// assert_eq!(ctx.service_metadata_for("system/bin/sh"), None);
    /// ```
    pub fn service_metadata_for(&self, path: &str) -> Option<&ServiceMetadata> {
        if let Some(meta) = self.direct_service(path) {
            return Some(meta);
        }
        let file_name = path.rsplit('/').next()?;
        let mut consumers: Vec<&String> = self.lib_usage.get(file_name)?.iter().collect();
        consumers.sort();
        consumers
            .into_iter()
            .find_map(|consumer| self.direct_service(consumer))
    }
}

/// A deep analyzer for one artifact kind.
pub trait Analyzer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Analyze one artifact pair.
    fn analyze(&self, pair: &ArtifactPair, ctx: &AnalysisContext) -> Result<AnalysisOutcome, FwdeltaError>;
}

/// Detected kind plus the entropy that was measured, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Selected kind.
    pub kind: ArtifactKind,
    /// Entropy of the sampled window.
    pub entropy: Option<f64>,
}

/// Decides the [`ArtifactKind`] of an artifact.
#[derive(Debug, Clone)]
pub struct Detector {
    entropy_threshold: f64,
    entropy_window: usize,
    archive_extensions: Vec<String>,
    certificate_dirs: Vec<String>,
    wrapper_magics: Vec<Vec<u8>>,
    wrapper_magic_offset: usize,
}

impl Default for Detector {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

impl Detector {
    /// Create a detector from the `[analysis]` table.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            entropy_threshold: config.entropy_threshold,
            entropy_window: config.entropy_window,
            archive_extensions: config
                .archive_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            certificate_dirs: config.certificate_dirs.clone(),
            wrapper_magics: config
                .wrapper_magics
                .iter()
                .map(|m| m.as_bytes().to_vec())
                .collect(),
            wrapper_magic_offset: config.wrapper_magic_offset,
        }
    }

    /// Number of leading bytes [`Detector::detect`] needs.
    pub fn head_len(&self) -> usize {
        let magic_end = self.wrapper_magic_offset
            + self.wrapper_magics.iter().map(Vec::len).max().unwrap_or(0);
        self.entropy_window.max(magic_end).max(20)
    }

    /// Decide the kind from a path and the leading bytes of its content.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_analyzers::dispatch::{ArtifactKind, Detector};
    ///
    /// let d = Detector::default();
    /// assert_eq!(d.detect("vendor/app/ta.bin", b"MCLF\x7fELF").kind, ArtifactKind::WrappedTrustedApp);
    /// assert_eq!(d.detect("system/app/Foo/Foo.apk", b"PK\x03\x04rest").kind, ArtifactKind::Archive);
    /// assert_eq!(d.detect("system/etc/security/cacerts/1234.0", b"-----BEGIN").kind, ArtifactKind::Certificate);
    /// assert_eq!(d.detect("system/etc/hosts", b"127.0.0.1 localhost\n").kind, ArtifactKind::Plain);
    /// ```
    pub fn detect(&self, path: &str, head: &[u8]) -> Detection {
        let detection = |kind, entropy| Detection { kind, entropy };

        if self.has_wrapper_magic(head) {
            return detection(ArtifactKind::WrappedTrustedApp, None);
        }

        let mut entropy = None;
        if !head.starts_with(ZIP_MAGIC) {
            let h = window_entropy(head, self.entropy_window);
            entropy = Some(h);
            if h > self.entropy_threshold {
                return detection(ArtifactKind::Opaque, entropy);
            }
        }

        if is_elf_executable(head) {
            return detection(ArtifactKind::Binary, entropy);
        }
        if self.has_archive_extension(path) {
            return detection(ArtifactKind::Archive, entropy);
        }
        if self.in_certificate_dir(path) {
            return detection(ArtifactKind::Certificate, entropy);
        }
        detection(ArtifactKind::Plain, entropy)
    }

    fn has_wrapper_magic(&self, head: &[u8]) -> bool {
        let Some(tail) = head.get(self.wrapper_magic_offset..) else {
            return false;
        };
        self.wrapper_magics
            .iter()
            .any(|magic| !magic.is_empty() && tail.starts_with(magic))
    }

    fn has_archive_extension(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.archive_extensions.contains(&ext))
    }

    fn in_certificate_dir(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        let dirs = &segments[..segments.len().saturating_sub(1)];
        dirs.iter()
            .any(|seg| self.certificate_dirs.iter().any(|d| d == seg))
    }
}

/// Returns `true` for ELF images of type executable or shared object.
pub fn is_elf_executable(head: &[u8]) -> bool {
    if !head.starts_with(ELF_MAGIC) || head.len() < 18 {
        return false;
    }
    let e_type = match head[5] {
        2 => u16::from_be_bytes([head[16], head[17]]),
        _ => u16::from_le_bytes([head[16], head[17]]),
    };
    e_type == ET_EXEC || e_type == ET_DYN
}

fn read_head(path: &Path, len: usize) -> Result<Vec<u8>, FwdeltaError> {
    let mut buf = Vec::with_capacity(len);
    File::open(path)?.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Result of [`DeepAnalyzer::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Detected kind, `None` when the artifact could not be read.
    pub kind: Option<ArtifactKind>,
    /// Analyzer outcome, degraded on failure.
    pub outcome: AnalysisOutcome,
}

/// Registry of analyzers keyed by [`ArtifactKind`].
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::dispatch::{DeepAnalyzer, Detector};
///
/// let deep = DeepAnalyzer::new(Detector::default());
/// assert!(deep.registered().is_empty());
/// ```
#[derive(Clone)]
pub struct DeepAnalyzer {
    detector: Detector,
    analyzers: BTreeMap<ArtifactKind, Arc<dyn Analyzer>>,
}

impl DeepAnalyzer {
    /// Create an empty registry.
    pub fn new(detector: Detector) -> Self {
        Self {
            detector,
            analyzers: BTreeMap::new(),
        }
    }

    /// Registry with the tool-backed analyzers for every analyzable kind.
    pub fn from_config(config: &FwdeltaConfig) -> Self {
        let binary = BinaryAnalyzer::from_config(&config.tools);
        let mut deep = Self::new(Detector::from_config(&config.analysis));
        deep.register(
            ArtifactKind::WrappedTrustedApp,
            Arc::new(WrappedTrustedAppAnalyzer::new(binary.clone())),
        )
        .register(ArtifactKind::Binary, Arc::new(binary))
        .register(
            ArtifactKind::Archive,
            Arc::new(ArchiveAnalyzer::from_config(&config.tools, &config.tiers)),
        )
        .register(
            ArtifactKind::Certificate,
            Arc::new(CertificateAnalyzer::new(config.analysis.certificate_text_diff)),
        );
        deep
    }

    /// Register (or replace) the analyzer for `kind`.
    pub fn register(&mut self, kind: ArtifactKind, analyzer: Arc<dyn Analyzer>) -> &mut Self {
        self.analyzers.insert(kind, analyzer);
        self
    }

    /// Kinds with a registered analyzer.
    pub fn registered(&self) -> Vec<ArtifactKind> {
        self.analyzers.keys().copied().collect()
    }

    /// Detect the kind of `pair` from its new side.
    ///
    /// # Errors
    ///
    /// Returns [`FwdeltaError::Io`] if the new side cannot be read.
    pub fn detect(&self, pair: &ArtifactPair) -> Result<Detection, FwdeltaError> {
        let head = read_head(&pair.new, self.detector.head_len())?;
        Ok(self.detector.detect(&pair.path, &head))
    }

    /// Detect and run the matching analyzer.
    pub fn dispatch(&self, pair: &ArtifactPair, ctx: &AnalysisContext) -> Dispatched {
        let detection = match self.detect(pair) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(path = %pair.path, "cannot read artifact: {e}");
                return Dispatched {
                    kind: None,
                    outcome: AnalysisOutcome::line_count_only(format!("unreadable: {e}")),
                };
            }
        };
        let kind = detection.kind;

        let outcome = match kind {
            ArtifactKind::Plain => AnalysisOutcome::line_count_only("no deep analyzer for this artifact type"),
            ArtifactKind::Opaque => {
                let entropy = detection.entropy.unwrap_or_default();
                AnalysisOutcome {
                    summary: format!("opaque content (entropy {entropy:.2} bits/byte)"),
                    digest: AnalysisDigest::Opaque { entropy },
                }
            }
            _ => match self.analyzers.get(&kind) {
                None => AnalysisOutcome::line_count_only(format!("no analyzer registered for {kind}")),
                Some(analyzer) => {
                    tracing::debug!(path = %pair.path, analyzer = analyzer.name(), "running analyzer");
                    match analyzer.analyze(pair, ctx) {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::warn!(path = %pair.path, analyzer = analyzer.name(), "analysis degraded: {e}");
                            AnalysisOutcome::line_count_only(e.to_string())
                        }
                    }
                }
            },
        };

        Dispatched {
            kind: Some(kind),
            outcome,
        }
    }
}
