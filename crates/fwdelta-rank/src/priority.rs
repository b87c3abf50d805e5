//! Deterministic review order for analyzed artifacts.
//!
//! Binaries are ordered by a cascade of stable sorts applied from the least
//! to the most significant key, so the final order is lexicographic over:
//!
//! 1. runs as root (user or group)
//! 2. has elevated capabilities
//! 3. mentioned in a service manifest
//! 4. trusted-execution binary
//! 5. hardening changed
//! 6. similarity, lowest first
//!
//! Fully identical binaries come last. Each pass must stay a stable sort;
//! replacing the cascade with an unstable sort breaks tie ordering.

use std::collections::BTreeMap;

use fwdelta_analyzers::digest::{AnalysisDigest, ArchiveDigest, BinaryDigest};
use fwdelta_core::Tier;
use serde::Serialize;

/// One ranked artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked<T> {
    /// Digest key of the artifact.
    pub key: String,
    /// Its digest.
    pub digest: T,
}

/// Similarity used for ordering; a missing score sorts as identical.
fn similarity(digest: &BinaryDigest) -> f64 {
    digest.similarity_score.unwrap_or(1.0)
}

/// Order binary digests for review.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::digest::{BinaryDigest, FunctionSummary};
/// use fwdelta_rank::priority::rank_binaries;
///
/// let changed = |score| BinaryDigest {
///     similarity_score: Some(score),
///     functions: FunctionSummary { total_functions: 2, identical_functions: 1, changed_functions: 1, ..Default::default() },
///     ..Default::default()
/// };
/// let a = changed(0.9);
/// let b = changed(0.4);
/// let ranked = rank_binaries([("a".to_string(), &a), ("b".to_string(), &b)]);
/// assert_eq!(ranked[0].key, "b");
/// ```
pub fn rank_binaries<'a, I>(entries: I) -> Vec<Ranked<BinaryDigest>>
where
    I: IntoIterator<Item = (String, &'a BinaryDigest)>,
{
    let (identical, mut ranked): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .map(|(key, digest)| Ranked {
            key,
            digest: digest.clone(),
        })
        .partition(|r| r.digest.is_fully_identical());

    ranked.sort_by(|a, b| similarity(&a.digest).total_cmp(&similarity(&b.digest)));
    ranked.sort_by_key(|r| r.digest.hardening_comparison.identical);
    ranked.sort_by_key(|r| !r.digest.is_trusted_execution_binary);
    ranked.sort_by_key(|r| !r.digest.mentioned_in_service_manifest);
    ranked.sort_by_key(|r| !r.digest.has_capabilities());
    ranked.sort_by_key(|r| !r.digest.runs_as_root());

    ranked.extend(identical);
    ranked
}

/// Order archive digests for review.
///
/// Archives with tier-1 changes come first, by tier-1 count descending; the
/// rest follow by tier-2 count descending. Ties keep input order.
pub fn rank_archives<'a, I>(entries: I) -> Vec<Ranked<ArchiveDigest>>
where
    I: IntoIterator<Item = (String, &'a ArchiveDigest)>,
{
    let (mut critical, mut rest): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .map(|(key, digest)| Ranked {
            key,
            digest: digest.clone(),
        })
        .partition(|r| r.digest.count(Tier::Critical) > 0);

    critical.sort_by_key(|r| std::cmp::Reverse(r.digest.count(Tier::Critical)));
    rest.sort_by_key(|r| std::cmp::Reverse(r.digest.count(Tier::Meaningful)));

    critical.extend(rest);
    critical
}

/// Ranked binaries and archives of one digest collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Ranking {
    /// Binaries and unwrapped trusted apps.
    pub binaries: Vec<Ranked<BinaryDigest>>,
    /// Application packages. Degraded packages carry no archive digest and
    /// never appear here.
    pub archives: Vec<Ranked<ArchiveDigest>>,
}

/// Rank every binary and archive digest of `digests`.
pub fn rank(digests: &BTreeMap<String, AnalysisDigest>) -> Ranking {
    let binaries = digests
        .iter()
        .filter_map(|(k, d)| d.as_binary().map(|b| (k.clone(), b)));
    let archives = digests
        .iter()
        .filter_map(|(k, d)| d.as_archive().map(|a| (k.clone(), a)));
    Ranking {
        binaries: rank_binaries(binaries),
        archives: rank_archives(archives),
    }
}
