use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Path used by diff tools for the missing side of a creation or deletion.
pub const NULL_DEVICE: &str = "/dev/null";

/// Line count for one side of a change.
///
/// Diff summaries report `-` instead of a number for binary content. That
/// sentinel is kept as [`LineCount::NonText`] so totals never silently
/// treat an unknown count as a real zero.
///
/// # Examples
///
/// ```
/// use fwdelta_core::LineCount;
///
/// let n: LineCount = "12".parse().unwrap();
/// assert_eq!(n, LineCount::Lines(12));
///
/// let bin: LineCount = "-".parse().unwrap();
/// assert!(bin.is_non_text());
/// assert_eq!(bin.summable(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineCount {
    /// A concrete number of lines.
    Lines(u64),
    /// Binary or otherwise non-text content.
    NonText,
}

impl LineCount {
    /// Token used in serialized output for non-text content.
    pub const NON_TEXT_TOKEN: &'static str = "NONTEXT";

    /// Contribution of this count to an aggregated sum.
    pub fn summable(self) -> u64 {
        match self {
            LineCount::Lines(n) => n,
            LineCount::NonText => 0,
        }
    }

    /// Returns `true` for the non-text sentinel.
    pub fn is_non_text(self) -> bool {
        matches!(self, LineCount::NonText)
    }
}

impl FromStr for LineCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-" => Ok(LineCount::NonText),
            other if other == Self::NON_TEXT_TOKEN => Ok(LineCount::NonText),
            other => other
                .parse::<u64>()
                .map(LineCount::Lines)
                .map_err(|_| format!("invalid line count: {other:?}")),
        }
    }
}

impl fmt::Display for LineCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineCount::Lines(n) => write!(f, "{n}"),
            LineCount::NonText => write!(f, "{}", Self::NON_TEXT_TOKEN),
        }
    }
}

impl Serialize for LineCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LineCount::Lines(n) => serializer.serialize_u64(*n),
            LineCount::NonText => serializer.serialize_str(Self::NON_TEXT_TOKEN),
        }
    }
}

impl<'de> Deserialize<'de> for LineCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(LineCount::Lines(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// How a path changed between the two snapshots.
///
/// # Examples
///
/// ```
/// use fwdelta_core::ChangeKind;
///
/// assert_eq!(ChangeKind::Renamed.to_string(), "renamed");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only in the new snapshot.
    Added,
    /// Present only in the old snapshot.
    Deleted,
    /// Present in both at the same path.
    Modified,
    /// Moved from `old_path` to `new_path`.
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

/// One normalized line of a diff summary.
///
/// Records are built through the kind-specific constructors so the path
/// invariants always hold: added records have no old path, renamed records
/// carry both paths, and deleted records keep the removed path as
/// `new_path`. Records are immutable once built.
///
/// # Examples
///
/// ```
/// use fwdelta_core::{ChangeKind, ChangeRecord, LineCount};
///
/// let rec = ChangeRecord::renamed(
///     "old/App.apk",
///     "new/App.apk",
///     LineCount::Lines(0),
///     LineCount::Lines(5),
/// );
/// assert_eq!(rec.change_kind(), ChangeKind::Renamed);
/// assert_eq!(rec.old_path(), Some("old/App.apk"));
/// assert_eq!(rec.new_path(), "new/App.apk");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    old_path: Option<String>,
    new_path: String,
    lines_added: LineCount,
    lines_deleted: LineCount,
    change_kind: ChangeKind,
}

impl ChangeRecord {
    /// A path that exists only in the new snapshot.
    pub fn added(path: impl Into<String>, added: LineCount, deleted: LineCount) -> Self {
        Self {
            old_path: None,
            new_path: path.into(),
            lines_added: added,
            lines_deleted: deleted,
            change_kind: ChangeKind::Added,
        }
    }

    /// A path that exists only in the old snapshot.
    pub fn deleted(path: impl Into<String>, added: LineCount, deleted: LineCount) -> Self {
        let path = path.into();
        Self {
            old_path: Some(path.clone()),
            new_path: path,
            lines_added: added,
            lines_deleted: deleted,
            change_kind: ChangeKind::Deleted,
        }
    }

    /// A path changed in place.
    pub fn modified(path: impl Into<String>, added: LineCount, deleted: LineCount) -> Self {
        let path = path.into();
        Self {
            old_path: Some(path.clone()),
            new_path: path,
            lines_added: added,
            lines_deleted: deleted,
            change_kind: ChangeKind::Modified,
        }
    }

    /// A path moved from `old` to `new`.
    pub fn renamed(
        old: impl Into<String>,
        new: impl Into<String>,
        added: LineCount,
        deleted: LineCount,
    ) -> Self {
        Self {
            old_path: Some(old.into()),
            new_path: new.into(),
            lines_added: added,
            lines_deleted: deleted,
            change_kind: ChangeKind::Renamed,
        }
    }

    /// Path in the old snapshot, `None` for additions.
    pub fn old_path(&self) -> Option<&str> {
        self.old_path.as_deref()
    }

    /// Path in the new snapshot (the removed path for deletions).
    pub fn new_path(&self) -> &str {
        &self.new_path
    }

    /// Lines added.
    pub fn lines_added(&self) -> LineCount {
        self.lines_added
    }

    /// Lines deleted.
    pub fn lines_deleted(&self) -> LineCount {
        self.lines_deleted
    }

    /// Kind of change.
    pub fn change_kind(&self) -> ChangeKind {
        self.change_kind
    }

    /// Returns `true` when both snapshots hold a version of the artifact.
    pub fn has_both_sides(&self) -> bool {
        matches!(self.change_kind, ChangeKind::Modified | ChangeKind::Renamed)
    }
}

/// Security-relevance bucket of a changed path.
///
/// Variants are ordered from most to least relevant.
///
/// # Examples
///
/// ```
/// use fwdelta_core::Tier;
///
/// let t: Tier = serde_json::from_str("\"tier_2_meaningful\"").unwrap();
/// assert_eq!(t, Tier::Meaningful);
/// assert!(Tier::Critical < Tier::Meaningful);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Manifest or compiled bytecode.
    #[serde(rename = "tier_1_critical")]
    Critical,
    /// Native libraries, assets, resources, managed bytecode.
    #[serde(rename = "tier_2_meaningful")]
    Meaningful,
    /// Signing material and packaging metadata.
    #[serde(rename = "tier_3_ignored")]
    Ignored,
    /// Anything else.
    #[serde(rename = "unclassified")]
    Unclassified,
}

impl Tier {
    /// Returns `true` for tiers that make an archive change meaningful.
    pub fn is_meaningful(self) -> bool {
        matches!(self, Tier::Critical | Tier::Meaningful)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Critical => write!(f, "tier_1_critical"),
            Tier::Meaningful => write!(f, "tier_2_meaningful"),
            Tier::Ignored => write!(f, "tier_3_ignored"),
            Tier::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Output format for CLI subcommands.
///
/// Implements [`FromStr`] so it can be used directly with `clap` argument parsing.
///
/// # Examples
///
/// ```
/// use fwdelta_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables and summaries.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
