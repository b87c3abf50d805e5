//! Rename notation in diff-summary path fields.
//!
//! Diff summaries encode renames two ways: a brace replacement compressing
//! the shared prefix and suffix (`lib/{arm => arm64}/libfoo.so`) and a
//! whole-path arrow (`old/App.apk => new/App.apk`). Anything else resolves
//! to the same path on both sides, flagged as not detected.

use std::fmt;

const ARROW: &str = "=>";

/// Which notation produced a [`RenameResolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameNotation {
    /// `prefix{old => new}suffix`.
    Brace,
    /// `old => new` with the arrow as a standalone field.
    Arrow,
    /// No usable rename marker.
    None,
}

impl fmt::Display for RenameNotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenameNotation::Brace => write!(f, "brace"),
            RenameNotation::Arrow => write!(f, "arrow"),
            RenameNotation::None => write!(f, "none"),
        }
    }
}

/// Old and new path decoded from a path field.
///
/// # Examples
///
/// ```
/// use fwdelta_difflens::rename::{resolve_rename, RenameNotation};
///
/// let r = resolve_rename("system/{lib => lib64}/libc.so");
/// assert!(r.detected);
/// assert_eq!(r.notation, RenameNotation::Brace);
/// assert_eq!(r.old_path, "system/lib/libc.so");
/// assert_eq!(r.new_path, "system/lib64/libc.so");
///
/// let plain = resolve_rename("system/bin/sh");
/// assert!(!plain.detected);
/// assert_eq!(plain.old_path, plain.new_path);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameResolution {
    /// Path in the old snapshot.
    pub old_path: String,
    /// Path in the new snapshot.
    pub new_path: String,
    /// `false` when no rename could be decoded and both paths equal the input.
    pub detected: bool,
    /// Notation that was recognized.
    pub notation: RenameNotation,
}

impl RenameResolution {
    fn unchanged(path: &str) -> Self {
        Self {
            old_path: path.to_string(),
            new_path: path.to_string(),
            detected: false,
            notation: RenameNotation::None,
        }
    }
}

/// Returns `true` if `field` carries any rename marker worth resolving.
pub fn has_rename_marker(field: &str) -> bool {
    field.contains(ARROW)
}

/// Decode a path field into `(old, new)`.
///
/// Brace notation is tried first and only accepted with exactly one `{`,
/// one `}` after it, and a single `=>` between them. Otherwise the field is
/// split on a standalone `=>` field; more than one arrow field is treated
/// as undecodable. Undecodable input returns the field on both sides with
/// `detected == false`.
pub fn resolve_rename(field: &str) -> RenameResolution {
    let field = field.trim();
    if !has_rename_marker(field) {
        return RenameResolution::unchanged(field);
    }

    if let Some(resolution) = resolve_brace(field) {
        return resolution;
    }

    resolve_arrow(field).unwrap_or_else(|| RenameResolution::unchanged(field))
}

fn resolve_brace(field: &str) -> Option<RenameResolution> {
    if field.matches(ARROW).count() != 1
        || field.matches('{').count() != 1
        || field.matches('}').count() != 1
    {
        return None;
    }

    let open = field.find('{')?;
    let close = field.find('}')?;
    if close < open {
        return None;
    }

    let inner = &field[open + 1..close];
    let (old_part, new_part) = inner.split_once(ARROW)?;
    let (old_part, new_part) = (old_part.trim(), new_part.trim());
    let prefix = &field[..open];
    let suffix = &field[close + 1..];

    Some(RenameResolution {
        old_path: join_parts(prefix, old_part, suffix),
        new_path: join_parts(prefix, new_part, suffix),
        detected: true,
        notation: RenameNotation::Brace,
    })
}

// An empty side (`dir/{ => sub}/file`) would otherwise leave a doubled slash.
fn join_parts(prefix: &str, middle: &str, suffix: &str) -> String {
    if middle.is_empty() && prefix.ends_with('/') && suffix.starts_with('/') {
        format!("{prefix}{}", &suffix[1..])
    } else {
        format!("{prefix}{middle}{suffix}")
    }
}

fn resolve_arrow(field: &str) -> Option<RenameResolution> {
    let standalone: Vec<usize> = field
        .match_indices(ARROW)
        .map(|(i, _)| i)
        .filter(|&i| {
            let before = field[..i].chars().next_back().map_or(true, char::is_whitespace);
            let after = field[i + ARROW.len()..].chars().next().map_or(true, char::is_whitespace);
            before && after
        })
        .collect();

    let [at] = standalone.as_slice() else {
        return None;
    };
    // only the separator whitespace around the arrow is dropped
    let left = field[..*at].trim_end();
    let right = field[*at + ARROW.len()..].trim_start();
    if left.is_empty() || right.is_empty() {
        return None;
    }

    Some(RenameResolution {
        old_path: left.to_string(),
        new_path: right.to_string(),
        detected: true,
        notation: RenameNotation::Arrow,
    })
}
