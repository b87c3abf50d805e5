//! Selection of records eligible for deep analysis.
//!
//! Only artifacts present in both snapshots can be compared, and paths
//! matching configured skip patterns never reach an analyzer.

use std::fmt;

use fwdelta_core::{AnalysisConfig, ChangeRecord};

/// Decides which change records are handed to deep analysis.
///
/// # Examples
///
/// ```
/// use fwdelta_core::{ChangeRecord, LineCount};
/// use fwdelta_difflens::filter::AnalysisFilter;
///
/// let filter = AnalysisFilter::default_filter();
/// let rec = ChangeRecord::added("system/bin/new", LineCount::Lines(1), LineCount::Lines(0));
/// assert!(filter.check_skip(&rec).is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AnalysisFilter {
    skip_patterns: Vec<glob::Pattern>,
}

impl AnalysisFilter {
    /// A filter without skip patterns.
    pub fn default_filter() -> Self {
        Self::default()
    }

    /// Create a filter from the `[analysis]` configuration table.
    ///
    /// Invalid glob patterns are logged and ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_core::{AnalysisConfig, ChangeRecord, LineCount};
    /// use fwdelta_difflens::filter::AnalysisFilter;
    ///
    /// let config = AnalysisConfig {
    ///     skip_patterns: vec!["vendor/firmware/**".into()],
    ///     ..AnalysisConfig::default()
    /// };
    /// let filter = AnalysisFilter::from_config(&config);
    /// let rec = ChangeRecord::modified("vendor/firmware/a.bin", LineCount::NonText, LineCount::NonText);
    /// assert!(filter.check_skip(&rec).is_some());
    /// ```
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let mut skip_patterns = Vec::new();
        for pat in &config.skip_patterns {
            match glob::Pattern::new(pat) {
                Ok(p) => skip_patterns.push(p),
                Err(e) => tracing::warn!(pattern = %pat, "ignoring invalid skip pattern: {e}"),
            }
        }
        Self { skip_patterns }
    }

    /// Reason `record` must not be analyzed, or `None` if it is eligible.
    pub fn check_skip(&self, record: &ChangeRecord) -> Option<SkipReason> {
        if !record.has_both_sides() {
            return Some(SkipReason::SingleSnapshot);
        }
        let path = record.new_path();
        self.skip_patterns
            .iter()
            .find(|pat| pat.matches(path))
            .map(|pat| SkipReason::PatternMatch(pat.to_string()))
    }

    /// Split records into analyzable ones and skipped ones.
    pub fn filter<'a, I>(&self, records: I) -> FilterResult
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let mut result = FilterResult::default();
        for record in records {
            match self.check_skip(record) {
                Some(reason) => result.skipped.push(SkippedRecord {
                    path: record.new_path().to_string(),
                    reason,
                }),
                None => result.kept.push(record.clone()),
            }
        }
        result
    }
}

/// Outcome of [`AnalysisFilter::filter`].
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    /// Records eligible for deep analysis.
    pub kept: Vec<ChangeRecord>,
    /// Records left out, with reasons.
    pub skipped: Vec<SkippedRecord>,
}

/// A record left out of deep analysis.
#[derive(Debug, Clone)]
pub struct SkippedRecord {
    /// Path of the record.
    pub path: String,
    /// Why it was left out.
    pub reason: SkipReason,
}

/// Reason a record was left out of deep analysis.
///
/// # Examples
///
/// ```
/// use fwdelta_difflens::filter::SkipReason;
///
/// assert_eq!(SkipReason::SingleSnapshot.to_string(), "present in one snapshot only");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Added or deleted; nothing to compare against.
    SingleSnapshot,
    /// Matched a configured skip pattern.
    PatternMatch(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SingleSnapshot => write!(f, "present in one snapshot only"),
            SkipReason::PatternMatch(pat) => write!(f, "pattern: {pat}"),
        }
    }
}
