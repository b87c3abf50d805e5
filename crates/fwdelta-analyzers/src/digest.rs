//! Per-artifact analysis results.

use std::collections::BTreeMap;

use fwdelta_core::{ChangeRecord, Tier};
use serde::{Deserialize, Serialize};

use crate::hardening::HardeningDiff;

/// Result of one deep-analysis run, keyed by artifact kind.
///
/// Digests are produced once by an analyzer and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::digest::AnalysisDigest;
///
/// let digest = AnalysisDigest::LineCountOnly { reason: "radiff2 failed".into() };
/// let json = serde_json::to_value(&digest).unwrap();
/// assert_eq!(json["kind"], "line_count_only");
/// assert!(digest.is_degraded());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisDigest {
    /// ELF executable or shared object, possibly unwrapped from a trusted-app container.
    Binary(BinaryDigest),
    /// Certificate store entry.
    Certificate(CertificateDigest),
    /// Application package.
    Archive(ArchiveDigest),
    /// Content indistinguishable from random data; not analyzed further.
    Opaque {
        /// Shannon entropy of the sampled window, in bits per byte.
        entropy: f64,
    },
    /// Deep analysis did not run or failed; only line counts are available.
    LineCountOnly {
        /// Why deep analysis is missing.
        reason: String,
    },
}

impl AnalysisDigest {
    /// Returns `true` when deep analysis was omitted or failed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, AnalysisDigest::LineCountOnly { .. })
    }

    /// Short name of the digest kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisDigest::Binary(_) => "binary",
            AnalysisDigest::Certificate(_) => "certificate",
            AnalysisDigest::Archive(_) => "archive",
            AnalysisDigest::Opaque { .. } => "opaque",
            AnalysisDigest::LineCountOnly { .. } => "line_count_only",
        }
    }

    /// The binary digest, if this is one.
    pub fn as_binary(&self) -> Option<&BinaryDigest> {
        match self {
            AnalysisDigest::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// The archive digest, if this is one.
    pub fn as_archive(&self) -> Option<&ArchiveDigest> {
        match self {
            AnalysisDigest::Archive(a) => Some(a),
            _ => None,
        }
    }

    /// The certificate digest, if this is one.
    pub fn as_certificate(&self) -> Option<&CertificateDigest> {
        match self {
            AnalysisDigest::Certificate(c) => Some(c),
            _ => None,
        }
    }
}

/// Function-level comparison counts.
///
/// `changed_functions == changed_matched + changed_unmatched` and
/// `total_functions == identical_functions + new_functions + changed_functions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSummary {
    /// Functions reported by the comparator.
    pub total_functions: u64,
    /// Non-new functions with similarity 1.0.
    pub identical_functions: u64,
    /// Functions only present in the new binary.
    pub new_functions: u64,
    /// Non-new functions with similarity below 1.0.
    pub changed_functions: u64,
    /// Changed functions the comparator still paired up.
    pub changed_matched: u64,
    /// Changed functions the comparator could not pair.
    pub changed_unmatched: u64,
}

/// Where a service-manifest entry referenced the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceSource {
    /// A `service` declaration.
    #[default]
    Service,
    /// An `exec` command.
    Exec,
    /// An `exec_start` command.
    ExecStart,
}

/// Execution context of a binary taken from the init service manifests.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::digest::ServiceMetadata;
///
/// let meta: ServiceMetadata =
///     serde_json::from_str(r#"{"user":"system","group":"root","source":"service"}"#).unwrap();
/// assert!(meta.runs_as_root());
/// assert!(!meta.has_capabilities());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// User the service runs as.
    #[serde(default)]
    pub user: Option<String>,
    /// Primary group of the service.
    #[serde(default)]
    pub group: Option<String>,
    /// Linux capabilities granted to the service.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Manifest construct that referenced the binary.
    #[serde(default)]
    pub source: ServiceSource,
}

impl ServiceMetadata {
    /// Returns `true` if the user or group is `root`.
    pub fn runs_as_root(&self) -> bool {
        self.user.as_deref() == Some("root") || self.group.as_deref() == Some("root")
    }

    /// Returns `true` if any capability is granted.
    pub fn has_capabilities(&self) -> bool {
        !self.capabilities.is_empty()
    }
}

/// Comparison of two versions of a binary or library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryDigest {
    /// Whole-file similarity in `[0, 1]`.
    pub similarity_score: Option<f64>,
    /// Comparator edit distance.
    pub edit_distance: Option<u64>,
    /// Function-level counts.
    #[serde(flatten)]
    pub functions: FunctionSummary,
    /// Referenced by a service manifest, directly or through a consuming binary.
    #[serde(default)]
    pub mentioned_in_service_manifest: bool,
    /// Execution context from the service manifest.
    #[serde(default)]
    pub service_metadata: Option<ServiceMetadata>,
    /// Unwrapped from a trusted-execution container.
    #[serde(default)]
    pub is_trusted_execution_binary: bool,
    /// Hardening property comparison.
    #[serde(default)]
    pub hardening_comparison: HardeningDiff,
}

impl BinaryDigest {
    /// Every analyzed function is identical between the snapshots.
    pub fn is_fully_identical(&self) -> bool {
        self.functions.identical_functions == self.functions.total_functions
    }

    /// Returns `true` if the service runs as root user or group.
    pub fn runs_as_root(&self) -> bool {
        self.service_metadata
            .as_ref()
            .is_some_and(ServiceMetadata::runs_as_root)
    }

    /// Returns `true` if the service is granted capabilities.
    pub fn has_capabilities(&self) -> bool {
        self.service_metadata
            .as_ref()
            .is_some_and(ServiceMetadata::has_capabilities)
    }
}

/// Equivalence of two certificate encodings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDigest {
    /// Any canonical field or the raw DER body differs.
    pub differs: bool,
    /// Names of the canonical fields that differ.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differing_fields: Vec<String>,
    /// SHA-256 of the old DER body, lowercase hex.
    pub old_sha256: String,
    /// SHA-256 of the new DER body, lowercase hex.
    pub new_sha256: String,
    /// Textual diff of the two sides, only when requested and differing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Content comparison of two application packages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDigest {
    /// Internal changes grouped by tier.
    pub tiered_changes: BTreeMap<Tier, Vec<ChangeRecord>>,
    /// Any tier-1 or tier-2 change exists.
    pub has_meaningful_change: bool,
    /// Deep diffs of modified bytecode files, keyed by internal path.
    #[serde(default)]
    pub dex_diffs: BTreeMap<String, String>,
}

impl ArchiveDigest {
    /// Build a digest from tier buckets, deriving `has_meaningful_change`.
    pub fn from_tiers(
        tiered_changes: BTreeMap<Tier, Vec<ChangeRecord>>,
        dex_diffs: BTreeMap<String, String>,
    ) -> Self {
        let has_meaningful_change = tiered_changes
            .iter()
            .any(|(tier, records)| tier.is_meaningful() && !records.is_empty());
        Self {
            tiered_changes,
            has_meaningful_change,
            dex_diffs,
        }
    }

    /// Number of changes in `tier`.
    pub fn count(&self, tier: Tier) -> usize {
        self.tiered_changes.get(&tier).map_or(0, Vec::len)
    }
}
