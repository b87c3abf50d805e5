//! Hierarchical change tree keyed by path segment.
//!
//! Leaves hold per-file statistics; directories hold the sum of their
//! children once [`ChangeTree::aggregate`] has run. Renames are also kept in
//! a side table serialized under [`RENAMED_KEY`].

use std::collections::BTreeMap;

use fwdelta_core::{ChangeKind, ChangeRecord, LineCount};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Reserved key holding the rename side table in serialized output.
pub const RENAMED_KEY: &str = "__renamed__";

/// Statistics for one changed file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeafEntry {
    /// Lines added.
    pub added: LineCount,
    /// Lines deleted.
    pub deleted: LineCount,
    /// Change kind.
    pub status: ChangeKind,
    /// Human-readable deep-analysis summary, if any ran.
    pub analysis: Option<String>,
}

impl LeafEntry {
    /// Build a leaf from a parsed record, without analysis.
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            added: record.lines_added(),
            deleted: record.lines_deleted(),
            status: record.change_kind(),
            analysis: None,
        }
    }
}

/// Entry of the rename side table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenamedEntry {
    /// Path in the old snapshot.
    pub old_path: String,
    /// Lines added.
    pub added: LineCount,
    /// Lines deleted.
    pub deleted: LineCount,
    /// Always [`ChangeKind::Renamed`].
    pub status: ChangeKind,
    /// Human-readable deep-analysis summary, if any ran.
    pub analysis: Option<String>,
}

/// A node of the tree: a directory or a changed file.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeNode {
    /// Interior node.
    Dir(DirNode),
    /// Terminal record.
    Leaf(LeafEntry),
}

impl Serialize for TreeNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TreeNode::Dir(dir) => dir.serialize(serializer),
            TreeNode::Leaf(leaf) => leaf.serialize(serializer),
        }
    }
}

/// Interior node with aggregated totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirNode {
    children: BTreeMap<String, TreeNode>,
    added: u64,
    deleted: u64,
}

impl DirNode {
    /// Child nodes by path segment.
    pub fn children(&self) -> &BTreeMap<String, TreeNode> {
        &self.children
    }

    /// `(added, deleted)` as of the last aggregation.
    pub fn totals(&self) -> (u64, u64) {
        (self.added, self.deleted)
    }

    /// Recompute totals as the sum over children, bottom-up.
    ///
    /// Prior totals are overwritten, never accumulated, so running this twice
    /// yields the same values. Non-text leaf counts contribute zero but stay
    /// tagged at the leaf. A directory without children totals `(0, 0)`.
    pub fn aggregate(&mut self) -> (u64, u64) {
        let mut added = 0;
        let mut deleted = 0;
        for child in self.children.values_mut() {
            let (a, d) = match child {
                TreeNode::Dir(dir) => dir.aggregate(),
                TreeNode::Leaf(leaf) => (leaf.added.summable(), leaf.deleted.summable()),
            };
            added += a;
            deleted += d;
        }
        self.added = added;
        self.deleted = deleted;
        (added, deleted)
    }

    fn insert(&mut self, segments: &[&str], leaf: LeafEntry) {
        let Some((head, rest)) = segments.split_first() else {
            return;
        };

        if rest.is_empty() {
            if let Some(TreeNode::Dir(_)) = self.children.get(*head) {
                tracing::warn!(segment = *head, "file path collides with a directory, keeping directory");
                return;
            }
            self.children.insert(head.to_string(), TreeNode::Leaf(leaf));
            return;
        }

        let child = self
            .children
            .entry(head.to_string())
            .or_insert_with(|| TreeNode::Dir(DirNode::default()));
        if let TreeNode::Leaf(_) = child {
            tracing::warn!(segment = *head, "directory path collides with a file, replacing file");
            *child = TreeNode::Dir(DirNode::default());
        }
        if let TreeNode::Dir(dir) = child {
            dir.insert(rest, leaf);
        }
    }

    fn get(&self, segments: &[&str]) -> Option<&TreeNode> {
        let (head, rest) = segments.split_first()?;
        let child = self.children.get(*head)?;
        if rest.is_empty() {
            return Some(child);
        }
        match child {
            TreeNode::Dir(dir) => dir.get(rest),
            TreeNode::Leaf(_) => None,
        }
    }

    fn get_mut(&mut self, segments: &[&str]) -> Option<&mut TreeNode> {
        let (head, rest) = segments.split_first()?;
        let child = self.children.get_mut(*head)?;
        if rest.is_empty() {
            return Some(child);
        }
        match child {
            TreeNode::Dir(dir) => dir.get_mut(rest),
            TreeNode::Leaf(_) => None,
        }
    }

    fn serialize_entries<M: SerializeMap>(&self, map: &mut M) -> Result<(), M::Error> {
        for (segment, node) in &self.children {
            map.serialize_entry(segment, node)?;
        }
        Ok(())
    }
}

impl Serialize for DirNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len() + 2))?;
        self.serialize_entries(&mut map)?;
        map.serialize_entry("added", &self.added)?;
        map.serialize_entry("deleted", &self.deleted)?;
        map.end()
    }
}

/// Change tree built once per diff summary.
///
/// # Examples
///
/// ```
/// use fwdelta_core::{ChangeRecord, LineCount};
/// use fwdelta_difflens::tree::ChangeTree;
///
/// let mut tree = ChangeTree::new();
/// tree.insert(&ChangeRecord::modified("system/bin/a", LineCount::Lines(3), LineCount::Lines(1)));
/// tree.insert(&ChangeRecord::modified("system/bin/b", LineCount::Lines(2), LineCount::Lines(0)));
/// assert_eq!(tree.aggregate(), (5, 1));
/// assert_eq!(tree.dir("system/bin").unwrap().totals(), (5, 1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChangeTree {
    root: DirNode,
    renamed: BTreeMap<String, RenamedEntry>,
    root_key: Option<String>,
}

impl ChangeTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty tree whose paths all hang under `key` (e.g. a build id).
    pub fn with_root_key(key: impl Into<String>) -> Self {
        Self {
            root_key: Some(key.into()),
            ..Self::default()
        }
    }

    fn segments<'a>(&'a self, path: &'a str) -> Vec<&'a str> {
        self.root_key
            .as_deref()
            .into_iter()
            .chain(path.split('/').filter(|s| !s.is_empty()))
            .collect()
    }

    /// Insert a record at its `new_path`; renames also enter the side table.
    pub fn insert(&mut self, record: &ChangeRecord) {
        let path = record.new_path();
        if path.split('/').all(str::is_empty) {
            tracing::warn!(path, "ignoring record with an empty path");
            return;
        }

        if record.change_kind() == ChangeKind::Renamed {
            if let Some(old_path) = record.old_path() {
                self.renamed.insert(
                    path.to_string(),
                    RenamedEntry {
                        old_path: old_path.to_string(),
                        added: record.lines_added(),
                        deleted: record.lines_deleted(),
                        status: ChangeKind::Renamed,
                        analysis: None,
                    },
                );
            }
        }

        let segments: Vec<String> = self.segments(path).into_iter().map(String::from).collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        self.insert_segments(&segments, LeafEntry::from_record(record));
    }

    /// Insert a leaf at explicit segments, creating directories lazily.
    pub fn insert_segments(&mut self, segments: &[&str], leaf: LeafEntry) {
        self.root.insert(segments, leaf);
    }

    /// Attach an analysis summary to the leaf at `path` (and its rename entry).
    ///
    /// Returns `false` if no leaf exists at `path`.
    pub fn set_analysis(&mut self, path: &str, summary: impl Into<String>) -> bool {
        let summary = summary.into();
        if let Some(entry) = self.renamed.get_mut(path) {
            entry.analysis = Some(summary.clone());
        }
        let segments: Vec<String> = self.segments(path).into_iter().map(String::from).collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        match self.root.get_mut(&segments) {
            Some(TreeNode::Leaf(leaf)) => {
                leaf.analysis = Some(summary);
                true
            }
            _ => false,
        }
    }

    /// Recompute directory totals; returns the root totals.
    ///
    /// Must not run while insertions are pending. The rename side table
    /// is never part of the sum.
    pub fn aggregate(&mut self) -> (u64, u64) {
        self.root.aggregate()
    }

    /// Node at a `/`-separated path.
    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        self.root.get(&self.segments(path))
    }

    /// Leaf at `path`, if the path names a changed file.
    pub fn leaf(&self, path: &str) -> Option<&LeafEntry> {
        match self.get(path)? {
            TreeNode::Leaf(leaf) => Some(leaf),
            TreeNode::Dir(_) => None,
        }
    }

    /// Directory at `path`, if the path names one.
    pub fn dir(&self, path: &str) -> Option<&DirNode> {
        match self.get(path)? {
            TreeNode::Dir(dir) => Some(dir),
            TreeNode::Leaf(_) => None,
        }
    }

    /// The root directory.
    pub fn root(&self) -> &DirNode {
        &self.root
    }

    /// Rename side table keyed by new path.
    pub fn renamed(&self) -> &BTreeMap<String, RenamedEntry> {
        &self.renamed
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        fn count(dir: &DirNode) -> usize {
            dir.children
                .values()
                .map(|node| match node {
                    TreeNode::Leaf(_) => 1,
                    TreeNode::Dir(d) => count(d),
                })
                .sum()
        }
        count(&self.root)
    }
}

/// A directory serialized together with the rename side table.
struct WithRenames<'a> {
    dir: &'a DirNode,
    renamed: &'a BTreeMap<String, RenamedEntry>,
}

impl Serialize for WithRenames<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.dir.children.len() + 3))?;
        self.dir.serialize_entries(&mut map)?;
        map.serialize_entry(RENAMED_KEY, self.renamed)?;
        map.serialize_entry("added", &self.dir.added)?;
        map.serialize_entry("deleted", &self.dir.deleted)?;
        map.end()
    }
}

/// With a root key, the side table sits inside the keyed node.
impl Serialize for ChangeTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(key) = &self.root_key else {
            return WithRenames {
                dir: &self.root,
                renamed: &self.renamed,
            }
            .serialize(serializer);
        };

        let empty = DirNode::default();
        let inner = match self.root.children.get(key) {
            Some(TreeNode::Dir(dir)) => dir,
            _ => &empty,
        };
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry(
            key,
            &WithRenames {
                dir: inner,
                renamed: &self.renamed,
            },
        )?;
        map.serialize_entry("added", &self.root.added)?;
        map.serialize_entry("deleted", &self.root.deleted)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: u64) -> LineCount {
        LineCount::Lines(n)
    }

    fn snapshot(tree: &ChangeTree) -> serde_json::Value {
        serde_json::to_value(tree).unwrap()
    }

    #[test]
    fn empty_tree_aggregates_to_zero() {
        let mut tree = ChangeTree::new();
        assert_eq!(tree.aggregate(), (0, 0));
        let mut dir = DirNode::default();
        assert_eq!(dir.aggregate(), (0, 0));
    }

    #[test]
    fn parent_is_sum_of_children() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::modified("d/x", lines(3), lines(1)));
        tree.insert(&ChangeRecord::modified("d/y", lines(2), lines(0)));
        tree.aggregate();
        assert_eq!(tree.dir("d").unwrap().totals(), (5, 1));
    }

    #[test]
    fn non_text_contributes_zero_but_stays_tagged() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::modified("lib/a.so", LineCount::NonText, LineCount::NonText));
        tree.insert(&ChangeRecord::modified("lib/b.txt", lines(4), lines(2)));
        assert_eq!(tree.aggregate(), (4, 2));
        let leaf = tree.leaf("lib/a.so").unwrap();
        assert!(leaf.added.is_non_text());
        assert_eq!(snapshot(&tree)["lib"]["a.so"]["added"], "NONTEXT");
    }

    #[test]
    fn aggregation_is_idempotent() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::modified("a/b/c", lines(7), lines(3)));
        tree.insert(&ChangeRecord::added("a/d", lines(1), lines(0)));
        tree.insert(&ChangeRecord::deleted("e", lines(0), lines(9)));
        let first_totals = tree.aggregate();
        let first = snapshot(&tree);
        let second_totals = tree.aggregate();
        assert_eq!(first_totals, second_totals);
        assert_eq!(first, snapshot(&tree));
        assert_eq!(first_totals, (8, 12));
    }

    #[test]
    fn renames_land_in_tree_and_side_table() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::renamed("old/App.apk", "new/App.apk", lines(0), lines(5)));
        tree.aggregate();
        let json = snapshot(&tree);
        assert_eq!(json["new"]["App.apk"]["status"], "renamed");
        assert_eq!(json[RENAMED_KEY]["new/App.apk"]["old_path"], "old/App.apk");
        assert_eq!(json["deleted"], 5);
        // side table never counts twice
        assert_eq!(tree.root().totals(), (0, 5));
    }

    #[test]
    fn interior_nodes_carry_totals_in_json() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::modified("system/bin/sh", lines(1), lines(1)));
        tree.aggregate();
        let json = snapshot(&tree);
        assert_eq!(json["system"]["added"], 1);
        assert_eq!(json["system"]["bin"]["deleted"], 1);
        assert!(json["system"]["bin"]["sh"]["analysis"].is_null());
    }

    #[test]
    fn root_key_wraps_paths() {
        let mut tree = ChangeTree::with_root_key("build_123");
        tree.insert(&ChangeRecord::modified("vendor/x", lines(2), lines(2)));
        tree.aggregate();
        assert!(tree.leaf("vendor/x").is_some());
        let json = snapshot(&tree);
        assert_eq!(json["build_123"]["vendor"]["x"]["added"], 2);
        assert_eq!(json["build_123"]["added"], 2);
        assert_eq!(json["added"], 2);
    }

    #[test]
    fn root_key_holds_rename_table() {
        let mut tree = ChangeTree::with_root_key("build_123");
        tree.insert(&ChangeRecord::renamed("a/x.apk", "b/x.apk", lines(0), lines(5)));
        tree.aggregate();
        let json = snapshot(&tree);
        assert!(json.get(RENAMED_KEY).is_none());
        assert_eq!(json["build_123"][RENAMED_KEY]["b/x.apk"]["old_path"], "a/x.apk");
        assert_eq!(json["build_123"]["b"]["deleted"], 5);

        let empty = snapshot(&ChangeTree::with_root_key("empty"));
        assert_eq!(empty["empty"]["added"], 0);
        assert!(empty["empty"][RENAMED_KEY].as_object().unwrap().is_empty());
    }

    #[test]
    fn set_analysis_updates_leaf_and_rename_entry() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::renamed("a/x.apk", "b/x.apk", lines(0), lines(0)));
        assert!(tree.set_analysis("b/x.apk", "no meaningful change"));
        assert_eq!(
            tree.leaf("b/x.apk").unwrap().analysis.as_deref(),
            Some("no meaningful change")
        );
        assert_eq!(
            tree.renamed()["b/x.apk"].analysis.as_deref(),
            Some("no meaningful change")
        );
        assert!(!tree.set_analysis("missing", "x"));
    }

    #[test]
    fn file_then_directory_collision_prefers_directory() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::deleted("etc/init", lines(0), lines(3)));
        tree.insert(&ChangeRecord::added("etc/init/hw.rc", lines(10), lines(0)));
        tree.insert(&ChangeRecord::modified("etc/init", lines(1), lines(1)));
        assert!(tree.dir("etc/init").is_some());
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn leading_slashes_are_ignored() {
        let mut tree = ChangeTree::new();
        tree.insert(&ChangeRecord::modified("/system//bin/ls", lines(1), lines(0)));
        assert!(tree.leaf("system/bin/ls").is_some());
        tree.insert(&ChangeRecord::modified("///", lines(1), lines(0)));
        assert_eq!(tree.leaf_count(), 1);
    }
}
