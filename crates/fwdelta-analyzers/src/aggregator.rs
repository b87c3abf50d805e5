//! Per-run collection of artifact digests.
//!
//! Digests are keyed by the last N segments of the artifact path so that
//! reports stay readable across snapshot roots. When two different artifacts
//! share a suffix, the later one is keyed by its full path instead, and by
//! the full path plus a `#n` counter if that key is taken as well.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::digest::AnalysisDigest;

/// Last `depth` `/`-separated segments of `path`.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::aggregator::suffix_key;
///
/// assert_eq!(suffix_key("fw/system/bin/netd", 3), "system/bin/netd");
/// assert_eq!(suffix_key("/bin/sh", 3), "bin/sh");
/// assert_eq!(suffix_key("a/b/c", 0), "a/b/c");
/// ```
pub fn suffix_key(path: &str, depth: usize) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if depth == 0 || segments.len() <= depth {
        return segments.join("/");
    }
    segments[segments.len() - depth..].join("/")
}

/// Digests of one run, keyed uniquely and deterministically.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DigestCollection {
    #[serde(skip)]
    depth: usize,
    #[serde(skip)]
    owners: BTreeMap<String, String>,
    #[serde(skip)]
    keys: BTreeMap<String, String>,
    entries: BTreeMap<String, AnalysisDigest>,
}

impl DigestCollection {
    /// Create an empty collection keyed by `depth` trailing segments.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    /// Insert the digest of the artifact at `path` and return its key.
    ///
    /// Re-inserting the same path replaces the earlier digest.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_analyzers::aggregator::DigestCollection;
    /// use fwdelta_analyzers::digest::AnalysisDigest;
    ///
    /// let mut digests = DigestCollection::new(2);
    /// let opaque = AnalysisDigest::Opaque { entropy: 7.9 };
    /// assert_eq!(digests.insert("a/vendor/bin/x", opaque.clone()), "bin/x");
    /// assert_eq!(digests.insert("b/system/bin/x", opaque), "b/system/bin/x");
    /// assert_eq!(digests.len(), 2);
    /// ```
    pub fn insert(&mut self, path: &str, digest: AnalysisDigest) -> String {
        let key = match self.keys.get(path) {
            Some(key) => key.clone(),
            None => {
                let key = self.free_key(path);
                self.keys.insert(path.to_string(), key.clone());
                self.owners.insert(key.clone(), path.to_string());
                key
            }
        };
        self.entries.insert(key.clone(), digest);
        key
    }

    fn free_key(&self, path: &str) -> String {
        let suffix = suffix_key(path, self.depth);
        let Some(owner) = self.owners.get(&suffix) else {
            return suffix;
        };
        let mut key = path.to_string();
        let mut n = 2;
        while self.owners.contains_key(&key) {
            key = format!("{path}#{n}");
            n += 1;
        }
        tracing::warn!(path, suffix = %suffix, owner = %owner, key = %key, "digest key collision");
        key
    }

    /// Digest stored under `key`.
    pub fn get(&self, key: &str) -> Option<&AnalysisDigest> {
        self.entries.get(key)
    }

    /// All entries in key order.
    pub fn entries(&self) -> &BTreeMap<String, AnalysisDigest> {
        &self.entries
    }

    /// Consume the collection into its key map.
    pub fn into_entries(self) -> BTreeMap<String, AnalysisDigest> {
        self.entries
    }

    /// Number of digests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no digest was collected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
