use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fwdelta_analyzers::digest::{AnalysisDigest, ArchiveDigest, BinaryDigest, CertificateDigest};
use fwdelta_analyzers::pipeline::PipelineOutput;
use fwdelta_core::Tier;
use fwdelta_difflens::parser::SkippedLine;
use serde::Serialize;

use crate::priority::{rank, Ranked};

/// Totals of the aggregated change tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeTotals {
    /// Changed files (leaves).
    pub files_changed: usize,
    /// Renamed files.
    pub renamed: usize,
    /// Summed added lines.
    pub lines_added: u64,
    /// Summed deleted lines.
    pub lines_deleted: u64,
}

/// An artifact classified as opaque.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpaqueEntry {
    /// Digest key.
    pub key: String,
    /// Measured entropy in bits per byte.
    pub entropy: f64,
}

/// An artifact whose deep analysis is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedEntry {
    /// Digest key.
    pub key: String,
    /// Why only line counts are available.
    pub reason: String,
}

/// Complete security-regression digest of one run.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use fwdelta_analyzers::digest::AnalysisDigest;
/// use fwdelta_rank::report::DigestReport;
///
/// let digests = BTreeMap::from([(
///     "bin/x".to_string(),
///     AnalysisDigest::LineCountOnly { reason: "radiff2 timed out after 300s".into() },
/// )]);
/// let report = DigestReport::from_digests(&digests);
/// assert_eq!(report.degraded.len(), 1);
/// assert!(report.to_markdown().contains("# Firmware Delta Report"));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct DigestReport {
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Change tree totals.
    pub totals: TreeTotals,
    /// Top-level record count per tier.
    pub tiers: BTreeMap<Tier, usize>,
    /// Ranked binaries.
    pub binaries: Vec<Ranked<BinaryDigest>>,
    /// Ranked packages.
    pub archives: Vec<Ranked<ArchiveDigest>>,
    /// Certificates that differ.
    pub certificates: Vec<Ranked<CertificateDigest>>,
    /// Opaque blobs.
    pub opaque: Vec<OpaqueEntry>,
    /// Artifacts reduced to line counts.
    pub degraded: Vec<DegradedEntry>,
    /// Malformed diff summary lines.
    pub skipped_lines: Vec<SkippedLine>,
    /// Records present in one snapshot only or excluded by pattern.
    pub not_analyzed: usize,
}

impl DigestReport {
    /// Build a report from digests alone, without tree information.
    pub fn from_digests(digests: &BTreeMap<String, AnalysisDigest>) -> Self {
        let ranking = rank(digests);
        let mut certificates = Vec::new();
        let mut opaque = Vec::new();
        let mut degraded = Vec::new();

        for (key, digest) in digests {
            match digest {
                AnalysisDigest::Certificate(c) if c.differs => certificates.push(Ranked {
                    key: key.clone(),
                    digest: c.clone(),
                }),
                AnalysisDigest::Opaque { entropy } => opaque.push(OpaqueEntry {
                    key: key.clone(),
                    entropy: *entropy,
                }),
                AnalysisDigest::LineCountOnly { reason } => degraded.push(DegradedEntry {
                    key: key.clone(),
                    reason: reason.clone(),
                }),
                _ => {}
            }
        }

        Self {
            generated_at: Utc::now(),
            totals: TreeTotals::default(),
            tiers: BTreeMap::new(),
            binaries: ranking.binaries,
            archives: ranking.archives,
            certificates,
            opaque,
            degraded,
            skipped_lines: Vec::new(),
            not_analyzed: 0,
        }
    }

    /// Build a report from a full pipeline run.
    pub fn from_pipeline(output: &PipelineOutput) -> Self {
        let mut report = Self::from_digests(output.digests.entries());
        let (lines_added, lines_deleted) = output.tree.root().totals();
        report.totals = TreeTotals {
            files_changed: output.tree.leaf_count(),
            renamed: output.tree.renamed().len(),
            lines_added,
            lines_deleted,
        };
        report.tiers = output
            .tiers
            .iter()
            .map(|(tier, records)| (*tier, records.len()))
            .collect();
        report.skipped_lines = output.skipped_lines.clone();
        report.not_analyzed = output.not_analyzed.len();
        report
    }

    /// Render the report as Markdown.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Firmware Delta Report\n\n");
        out.push_str(&format!(
            "**Changed:** {} files ({} renamed), +{} / -{} lines\n\n",
            self.totals.files_changed, self.totals.renamed, self.totals.lines_added, self.totals.lines_deleted
        ));

        if !self.tiers.is_empty() {
            out.push_str("| Tier | Paths |\n|------|-------|\n");
            for (tier, count) in &self.tiers {
                out.push_str(&format!("| {tier} | {count} |\n"));
            }
            out.push('\n');
        }

        if !self.binaries.is_empty() {
            out.push_str("## Binaries\n\n");
            out.push_str("| # | Binary | Similarity | Changed fns | Hardening | Root | Caps | Service | TEE |\n");
            out.push_str("|---|--------|------------|-------------|-----------|------|------|---------|-----|\n");
            for (i, r) in self.binaries.iter().enumerate() {
                let d = &r.digest;
                out.push_str(&format!(
                    "| {} | `{}` | {} | {}/{} | {} | {} | {} | {} | {} |\n",
                    i + 1,
                    r.key,
                    similarity_cell(d),
                    d.functions.changed_functions,
                    d.functions.total_functions,
                    hardening_cell(d),
                    mark(d.runs_as_root()),
                    mark(d.has_capabilities()),
                    mark(d.mentioned_in_service_manifest),
                    mark(d.is_trusted_execution_binary),
                ));
            }
            out.push('\n');
        }

        if !self.archives.is_empty() {
            out.push_str("## Packages\n\n| # | Package | Tier 1 | Tier 2 | Dex diffs |\n|---|---------|--------|--------|-----------|\n");
            for (i, r) in self.archives.iter().enumerate() {
                out.push_str(&format!(
                    "| {} | `{}` | {} | {} | {} |\n",
                    i + 1,
                    r.key,
                    r.digest.count(Tier::Critical),
                    r.digest.count(Tier::Meaningful),
                    r.digest.dex_diffs.len()
                ));
            }
            out.push('\n');
        }

        if !self.certificates.is_empty() {
            out.push_str("## Certificates\n\n");
            for r in &self.certificates {
                out.push_str(&format!("- `{}`: {}\n", r.key, certificate_fields(&r.digest)));
            }
            out.push('\n');
        }

        if !self.opaque.is_empty() {
            out.push_str("## Opaque blobs\n\n");
            for o in &self.opaque {
                out.push_str(&format!("- `{}` ({:.2} bits/byte)\n", o.key, o.entropy));
            }
            out.push('\n');
        }

        if !self.degraded.is_empty() {
            out.push_str("## Not analyzed\n\n");
            for d in &self.degraded {
                out.push_str(&format!("- `{}`: {}\n", d.key, d.reason));
            }
            out.push('\n');
        }

        if !self.skipped_lines.is_empty() {
            out.push_str(&format!("**Skipped lines:** {}\n", self.skipped_lines.len()));
        }
        out
    }
}

fn mark(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        ""
    }
}

fn similarity_cell(d: &BinaryDigest) -> String {
    d.similarity_score
        .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"))
}

fn hardening_cell(d: &BinaryDigest) -> String {
    if d.hardening_comparison.identical {
        "same".to_string()
    } else {
        format!("{} regressions", d.hardening_comparison.regressions())
    }
}

fn certificate_fields(c: &CertificateDigest) -> String {
    if c.differing_fields.is_empty() {
        "raw body differs".to_string()
    } else {
        c.differing_fields.join(", ")
    }
}

impl fmt::Display for DigestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Firmware Delta Report")?;
        writeln!(f, "=====================")?;
        writeln!(
            f,
            "Changed: {} files ({} renamed), +{} / -{} lines\n",
            self.totals.files_changed, self.totals.renamed, self.totals.lines_added, self.totals.lines_deleted
        )?;

        for (tier, count) in &self.tiers {
            writeln!(f, "{tier:<20} {count:>6}")?;
        }

        if !self.binaries.is_empty() {
            writeln!(f, "\n{:<4} {:<48} {:>10} {:>9} {:>12}", "#", "Binary", "Similarity", "Changed", "Hardening")?;
            writeln!(f, "{}", "-".repeat(87))?;
            for (i, r) in self.binaries.iter().enumerate() {
                let d = &r.digest;
                writeln!(
                    f,
                    "{:<4} {:<48} {:>10} {:>4}/{:<4} {:>12}",
                    i + 1,
                    r.key,
                    similarity_cell(d),
                    d.functions.changed_functions,
                    d.functions.total_functions,
                    hardening_cell(d),
                )?;
            }
        }

        if !self.archives.is_empty() {
            writeln!(f, "\n{:<4} {:<48} {:>7} {:>7}", "#", "Package", "Tier 1", "Tier 2")?;
            writeln!(f, "{}", "-".repeat(69))?;
            for (i, r) in self.archives.iter().enumerate() {
                writeln!(
                    f,
                    "{:<4} {:<48} {:>7} {:>7}",
                    i + 1,
                    r.key,
                    r.digest.count(Tier::Critical),
                    r.digest.count(Tier::Meaningful)
                )?;
            }
        }

        for r in &self.certificates {
            writeln!(f, "\ncertificate {} differs: {}", r.key, certificate_fields(&r.digest))?;
        }
        for o in &self.opaque {
            writeln!(f, "opaque {} ({:.2} bits/byte)", o.key, o.entropy)?;
        }
        for d in &self.degraded {
            writeln!(f, "not analyzed {}: {}", d.key, d.reason)?;
        }

        writeln!(
            f,
            "\nSummary: {} binaries, {} packages, {} certificates changed, {} skipped lines",
            self.binaries.len(),
            self.archives.len(),
            self.certificates.len(),
            self.skipped_lines.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use fwdelta_analyzers::digest::FunctionSummary;

    use super::*;

    fn sample() -> BTreeMap<String, AnalysisDigest> {
        BTreeMap::from([
            (
                "system/bin/netd".to_string(),
                AnalysisDigest::Binary(BinaryDigest {
                    similarity_score: Some(0.5),
                    functions: FunctionSummary {
                        total_functions: 4,
                        identical_functions: 2,
                        changed_functions: 2,
                        changed_matched: 2,
                        ..FunctionSummary::default()
                    },
                    ..BinaryDigest::default()
                }),
            ),
            (
                "cacerts/a.0".to_string(),
                AnalysisDigest::Certificate(CertificateDigest {
                    differs: true,
                    differing_fields: vec!["subject".into()],
                    ..CertificateDigest::default()
                }),
            ),
            (
                "cacerts/b.0".to_string(),
                AnalysisDigest::Certificate(CertificateDigest::default()),
            ),
            ("fw/blob.img".to_string(), AnalysisDigest::Opaque { entropy: 7.99 }),
        ])
    }

    #[test]
    fn sections_are_filled() {
        let report = DigestReport::from_digests(&sample());
        assert_eq!(report.binaries.len(), 1);
        assert_eq!(report.certificates.len(), 1);
        assert_eq!(report.opaque.len(), 1);
        assert!(report.degraded.is_empty());
    }

    #[test]
    fn text_and_markdown_mention_artifacts() {
        let report = DigestReport::from_digests(&sample());
        let text = report.to_string();
        assert!(text.contains("system/bin/netd"));
        assert!(text.contains("certificate cacerts/a.0 differs: subject"));
        let md = report.to_markdown();
        assert!(md.contains("## Binaries"));
        assert!(md.contains("| 1 | `system/bin/netd` | 0.500 | 2/4 | same |"));
        assert!(md.contains("- `fw/blob.img` (7.99 bits/byte)"));
    }

    #[test]
    fn json_keeps_rank_order() {
        let report = DigestReport::from_digests(&sample());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["binaries"][0]["key"], "system/bin/netd");
        assert_eq!(json["binaries"][0]["digest"]["total_functions"], 4);
        assert!(json["generated_at"].is_string());
    }
}
