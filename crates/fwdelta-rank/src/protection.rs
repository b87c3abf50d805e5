//! Permission protection-level scoring and digests.
//!
//! A protection-level descriptor is one base level plus pipe-delimited
//! modifier flags, e.g. `signature|privileged|development`. Scores come from
//! the `[protection]` weight tables and only matter relative to each other:
//! a higher score means a stricter permission.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use fwdelta_core::ProtectionWeights;
use fwdelta_difflens::parser::SkippedLine;
use serde::{Deserialize, Serialize};

/// Protection score, stored in tenths of a point.
///
/// # Examples
///
/// ```
/// use fwdelta_rank::protection::ProtectionScore;
///
/// assert_eq!(ProtectionScore::from_tenths(350).to_string(), "35");
/// assert_eq!(ProtectionScore::from_tenths(305).to_string(), "30.5");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProtectionScore(u32);

impl ProtectionScore {
    /// Wrap a raw value in tenths of a point.
    pub fn from_tenths(tenths: u32) -> Self {
        Self(tenths)
    }

    /// Raw value in tenths of a point.
    pub fn tenths(self) -> u32 {
        self.0
    }
}

impl Add for ProtectionScore {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for ProtectionScore {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl fmt::Display for ProtectionScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 % 10 {
            0 => write!(f, "{}", self.0 / 10),
            frac => write!(f, "{}.{frac}", self.0 / 10),
        }
    }
}

/// Turns protection-level descriptors into comparable scores.
#[derive(Debug, Clone)]
pub struct ProtectionLevelScorer {
    weights: ProtectionWeights,
}

impl Default for ProtectionLevelScorer {
    fn default() -> Self {
        Self::from_config(&ProtectionWeights::default())
    }
}

impl ProtectionLevelScorer {
    /// Create a scorer from the `[protection]` weight tables.
    pub fn from_config(weights: &ProtectionWeights) -> Self {
        Self {
            weights: weights.clone(),
        }
    }

    /// Score a descriptor.
    ///
    /// The first token naming a base level is the base; every other
    /// non-empty token is a flag. Without a recognized base the default base
    /// applies. Unknown flags weigh the default flag weight.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_rank::protection::ProtectionLevelScorer;
    ///
    /// let scorer = ProtectionLevelScorer::default();
    /// assert!(scorer.score("dangerous") < scorer.score("signature|privileged"));
    /// assert_eq!(scorer.score(""), scorer.score("normal"));
    /// assert_eq!(scorer.score("signature|privileged").to_string(), "35");
    /// ```
    pub fn score(&self, descriptor: &str) -> ProtectionScore {
        let mut base = None;
        let mut flags = 0u32;

        for token in descriptor.split('|').map(str::trim).filter(|t| !t.is_empty()) {
            match self.weights.base_levels.get(token) {
                Some(&value) if base.is_none() => base = Some(value),
                _ => {
                    let weight = self
                        .weights
                        .flag_weights
                        .get(token)
                        .copied()
                        .unwrap_or(self.weights.default_flag_weight);
                    flags = flags.saturating_add(weight);
                }
            }
        }

        let base = base.unwrap_or_else(|| {
            self.weights
                .base_levels
                .get(&self.weights.default_base)
                .copied()
                .unwrap_or_default()
        });
        ProtectionScore(base.saturating_add(flags))
    }
}

#[derive(Deserialize)]
struct PermissionLine {
    permission_name: String,
    #[serde(default)]
    protection_level: Option<String>,
}

/// Permission name to descriptor, plus the lines that could not be read.
#[derive(Debug, Clone, Default)]
pub struct PermissionLevels {
    /// Descriptor per permission; a repeated name keeps its last descriptor.
    pub levels: BTreeMap<String, String>,
    /// Rejected input lines.
    pub skipped: Vec<SkippedLine>,
}

/// Parse a permission dump with one JSON object per line.
///
/// Each object needs `permission_name`; a missing or null
/// `protection_level` reads as empty. Bad lines are skipped and logged.
///
/// # Examples
///
/// ```
/// use fwdelta_rank::protection::parse_permission_levels;
///
/// let input = r#"{"permission_name": "android.permission.CAMERA", "protection_level": "dangerous"}
/// not json
/// {"permission_name": "x.LEGACY", "protection_level": null}
/// "#;
/// let parsed = parse_permission_levels(input);
/// assert_eq!(parsed.levels["android.permission.CAMERA"], "dangerous");
/// assert_eq!(parsed.levels["x.LEGACY"], "");
/// assert_eq!(parsed.skipped.len(), 1);
/// ```
pub fn parse_permission_levels(input: &str) -> PermissionLevels {
    let mut parsed = PermissionLevels::default();

    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PermissionLine>(line) {
            Ok(entry) => {
                parsed
                    .levels
                    .insert(entry.permission_name, entry.protection_level.unwrap_or_default());
            }
            Err(e) => {
                tracing::warn!(line = idx + 1, "skipping permission line: {e}");
                parsed.skipped.push(SkippedLine {
                    line_number: idx + 1,
                    content: line.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    parsed
}

/// A permission whose score moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelChange {
    /// Permission name.
    pub permission_name: String,
    /// Old descriptor.
    pub old_level: String,
    /// New descriptor.
    pub new_level: String,
    /// Score of the old descriptor.
    pub old_score: ProtectionScore,
    /// Score of the new descriptor.
    pub new_score: ProtectionScore,
}

/// A permission only in the new dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedPermission {
    /// Permission name.
    pub permission_name: String,
    /// Its descriptor.
    pub new_level: String,
}

/// A permission only in the old dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedPermission {
    /// Permission name.
    pub permission_name: String,
    /// Its former descriptor.
    pub old_level: String,
}

/// Protection-level changes between two permission dumps, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtectionDigest {
    /// Permissions that became stricter.
    pub increased: Vec<LevelChange>,
    /// Permissions that became weaker.
    pub decreased: Vec<LevelChange>,
    /// New permissions.
    pub added: Vec<AddedPermission>,
    /// Removed permissions.
    pub removed: Vec<RemovedPermission>,
}

impl ProtectionDigest {
    /// The score change recorded for `permission`, if any.
    pub fn change_for(&self, permission: &str) -> Option<&LevelChange> {
        self.increased
            .iter()
            .chain(&self.decreased)
            .find(|c| c.permission_name == permission)
    }
}

impl fmt::Display for ProtectionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.increased {
            writeln!(f, "[INCREASED] {}: {} → {}", c.permission_name, c.old_level, c.new_level)?;
        }
        for c in &self.decreased {
            writeln!(f, "[DECREASED] {}: {} → {}", c.permission_name, c.old_level, c.new_level)?;
        }
        for p in &self.removed {
            writeln!(f, "[REMOVED] {}", p.permission_name)?;
        }
        for p in &self.added {
            writeln!(f, "[ADDED] {}: {}", p.permission_name, p.new_level)?;
        }
        Ok(())
    }
}

/// Compare two permission dumps by score.
///
/// Permissions whose descriptor changed without changing the score are not
/// reported.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use fwdelta_rank::protection::{diff_protection_levels, ProtectionLevelScorer};
///
/// let old = BTreeMap::from([("p.A".to_string(), "signature".to_string())]);
/// let new = BTreeMap::from([("p.A".to_string(), "normal".to_string())]);
/// let digest = diff_protection_levels(&ProtectionLevelScorer::default(), &old, &new);
/// assert_eq!(digest.decreased.len(), 1);
/// ```
pub fn diff_protection_levels(
    scorer: &ProtectionLevelScorer,
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> ProtectionDigest {
    let mut digest = ProtectionDigest::default();

    for (name, old_level) in old {
        let Some(new_level) = new.get(name) else {
            digest.removed.push(RemovedPermission {
                permission_name: name.clone(),
                old_level: old_level.clone(),
            });
            continue;
        };
        let old_score = scorer.score(old_level);
        let new_score = scorer.score(new_level);
        let change = LevelChange {
            permission_name: name.clone(),
            old_level: old_level.clone(),
            new_level: new_level.clone(),
            old_score,
            new_score,
        };
        if new_score > old_score {
            digest.increased.push(change);
        } else if new_score < old_score {
            digest.decreased.push(change);
        }
    }

    digest.added = new
        .iter()
        .filter(|(name, _)| !old.contains_key(*name))
        .map(|(name, level)| AddedPermission {
            permission_name: name.clone(),
            new_level: level.clone(),
        })
        .collect();

    tracing::debug!(
        increased = digest.increased.len(),
        decreased = digest.decreased.len(),
        added = digest.added.len(),
        removed = digest.removed.len(),
        "compared protection levels"
    );
    digest
}

/// GID to the permissions it grants.
pub type GidPermissions = BTreeMap<String, Vec<String>>;

/// A GID whose protection moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GidChange {
    /// Group id or name.
    pub gid: String,
    /// Set when the permission set is unchanged and this permission's level moved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    /// `score <old> -> <new>`.
    pub change: String,
    /// Permissions granted only in the new snapshot.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_permissions: Vec<String>,
    /// Permissions granted only in the old snapshot.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_permissions: Vec<String>,
}

/// GIDs whose protection became stricter or weaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GidDigest {
    /// Stricter.
    pub increased: Vec<GidChange>,
    /// Weaker.
    pub decreased: Vec<GidChange>,
}

impl fmt::Display for GidDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, changes) in [("INCREASED", &self.increased), ("DECREASED", &self.decreased)] {
            for c in changes {
                match &c.permission {
                    Some(p) => writeln!(f, "[{label}] {} via {p}: {}", c.gid, c.change)?,
                    None => writeln!(f, "[{label}] {}: {}", c.gid, c.change)?,
                }
            }
        }
        Ok(())
    }
}

/// Inputs of [`compare_gids`] for one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct GidSnapshot<'a> {
    /// GID to permissions.
    pub gids: &'a GidPermissions,
    /// Permission descriptors of the same snapshot.
    pub levels: &'a BTreeMap<String, String>,
}

/// Compare GID protection between two snapshots.
///
/// A GID whose permission set changed is scored as the sum of its
/// permissions' scores, each against its own snapshot's levels; unknown
/// permissions score as `normal`. A GID with an unchanged set is reported
/// once per permission whose level moved in `digest`.
pub fn compare_gids(
    scorer: &ProtectionLevelScorer,
    old: GidSnapshot<'_>,
    new: GidSnapshot<'_>,
    digest: &ProtectionDigest,
) -> GidDigest {
    let total = |perms: &BTreeSet<&String>, levels: &BTreeMap<String, String>| -> ProtectionScore {
        perms
            .iter()
            .map(|p| scorer.score(levels.get(*p).map_or("", String::as_str)))
            .sum()
    };

    let gids: BTreeSet<&String> = old.gids.keys().chain(new.gids.keys()).collect();
    let mut result = GidDigest::default();

    for gid in gids {
        let old_perms: BTreeSet<&String> = old.gids.get(gid).into_iter().flatten().collect();
        let new_perms: BTreeSet<&String> = new.gids.get(gid).into_iter().flatten().collect();

        if old_perms != new_perms {
            let old_score = total(&old_perms, old.levels);
            let new_score = total(&new_perms, new.levels);
            let change = GidChange {
                gid: gid.clone(),
                permission: None,
                change: format!("score {old_score} -> {new_score}"),
                added_permissions: new_perms.difference(&old_perms).map(|p| p.to_string()).collect(),
                removed_permissions: old_perms.difference(&new_perms).map(|p| p.to_string()).collect(),
            };
            if new_score > old_score {
                result.increased.push(change);
            } else if new_score < old_score {
                result.decreased.push(change);
            }
            continue;
        }

        for perm in new_perms {
            let Some(level) = digest.change_for(perm) else {
                continue;
            };
            let change = GidChange {
                gid: gid.clone(),
                permission: Some(perm.clone()),
                change: format!("score {} -> {}", level.old_score, level.new_score),
                added_permissions: Vec::new(),
                removed_permissions: Vec::new(),
            };
            if level.new_score > level.old_score {
                result.increased.push(change);
            } else if level.new_score < level.old_score {
                result.decreased.push(change);
            }
        }
    }

    result
}
