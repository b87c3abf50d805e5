use std::fmt;

use fwdelta_core::{ChangeKind, ChangeRecord, FwdeltaError, LineCount, NULL_DEVICE};
use serde::Serialize;

use crate::rename::{has_rename_marker, resolve_rename};

/// A summary line that could not be turned into a [`ChangeRecord`].
///
/// # Examples
///
/// ```
/// use fwdelta_difflens::parser::parse_summary;
///
/// let parsed = parse_summary("3\t1\tsystem/bin/init\ngarbage\n");
/// assert_eq!(parsed.records.len(), 1);
/// assert_eq!(parsed.skipped.len(), 1);
/// assert_eq!(parsed.skipped[0].line_number, 2);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct SkippedLine {
    /// 1-based line number in the input.
    pub line_number: usize,
    /// The raw line.
    pub content: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for SkippedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({:?})", self.line_number, self.reason, self.content)
    }
}

/// Records and rejected lines from one diff summary.
#[derive(Debug, Clone, Default)]
pub struct SummaryParse {
    /// Successfully parsed records, in input order.
    pub records: Vec<ChangeRecord>,
    /// Malformed lines, in input order.
    pub skipped: Vec<SkippedLine>,
}

/// Parse a whole diff summary (`<added>\t<deleted>\t<path-or-rename>` per line).
///
/// Blank lines are ignored. Malformed lines are collected in
/// [`SummaryParse::skipped`] and logged; they never abort the batch.
///
/// # Examples
///
/// ```
/// use fwdelta_core::ChangeKind;
/// use fwdelta_difflens::parser::parse_summary;
///
/// let input = "1\t0\tvendor/{lib => lib64}/libx.so\n-\t-\tsystem/app/Foo.apk\n";
/// let parsed = parse_summary(input);
/// assert_eq!(parsed.records[0].change_kind(), ChangeKind::Renamed);
/// assert_eq!(parsed.records[1].change_kind(), ChangeKind::Modified);
/// ```
pub fn parse_summary(input: &str) -> SummaryParse {
    let mut parsed = SummaryParse::default();

    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_number = idx + 1;
        match parse_summary_line(line, line_number) {
            Ok(record) => parsed.records.push(record),
            Err(err) => {
                tracing::warn!(line = line_number, "skipping diff summary line: {err}");
                let reason = match err {
                    FwdeltaError::MalformedLine { reason, .. } => reason,
                    other => other.to_string(),
                };
                parsed.skipped.push(SkippedLine {
                    line_number,
                    content: line.to_string(),
                    reason,
                });
            }
        }
    }

    tracing::debug!(
        records = parsed.records.len(),
        skipped = parsed.skipped.len(),
        "parsed diff summary"
    );
    parsed
}

/// Parse one summary line into a [`ChangeRecord`].
///
/// Decision order: a rename marker is resolved first; a resolved side equal
/// to `/dev/null` turns the record into an addition or deletion; a detected
/// rename with distinct sides is a rename; everything else is a
/// modification.
///
/// # Errors
///
/// Returns [`FwdeltaError::MalformedLine`] if the line has fewer than three
/// whitespace-separated fields or a count that is neither a number nor `-`.
///
/// # Examples
///
/// ```
/// use fwdelta_core::{ChangeKind, LineCount};
/// use fwdelta_difflens::parser::parse_summary_line;
///
/// let rec = parse_summary_line("0\t12\tsystem/bin/vold => /dev/null", 1).unwrap();
/// assert_eq!(rec.change_kind(), ChangeKind::Deleted);
/// assert_eq!(rec.new_path(), "system/bin/vold");
/// assert_eq!(rec.lines_deleted(), LineCount::Lines(12));
///
/// assert!(parse_summary_line("5\t2", 2).is_err());
/// ```
pub fn parse_summary_line(line: &str, line_number: usize) -> Result<ChangeRecord, FwdeltaError> {
    let malformed = |reason: String| FwdeltaError::MalformedLine {
        line: line_number,
        reason,
    };

    let (added_field, rest) = next_field(line)
        .ok_or_else(|| malformed("expected at least 3 fields, found 0".into()))?;
    let (deleted_field, rest) = next_field(rest)
        .ok_or_else(|| malformed("expected at least 3 fields, found 1".into()))?;
    let path_field = rest.trim();
    if path_field.is_empty() {
        return Err(malformed("expected at least 3 fields, found 2".into()));
    }

    let added: LineCount = added_field.parse().map_err(malformed)?;
    let deleted: LineCount = deleted_field.parse().map_err(malformed)?;

    Ok(classify_path_field(path_field, added, deleted))
}

fn classify_path_field(path_field: &str, added: LineCount, deleted: LineCount) -> ChangeRecord {
    if !has_rename_marker(path_field) {
        return ChangeRecord::modified(path_field, added, deleted);
    }

    let resolution = resolve_rename(path_field);
    if !resolution.detected {
        tracing::debug!(path = path_field, "unrecognized rename notation, treating as modified");
        return ChangeRecord::modified(resolution.new_path, added, deleted);
    }

    match (
        resolution.old_path == NULL_DEVICE,
        resolution.new_path == NULL_DEVICE,
    ) {
        (true, false) => ChangeRecord::added(resolution.new_path, added, deleted),
        (false, true) => ChangeRecord::deleted(resolution.old_path, added, deleted),
        _ if resolution.old_path == resolution.new_path => {
            ChangeRecord::modified(resolution.new_path, added, deleted)
        }
        _ => ChangeRecord::renamed(resolution.old_path, resolution.new_path, added, deleted),
    }
}

/// Split off the next whitespace-delimited field, returning it and the remainder.
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], &s[end..])),
        None => Some((s, "")),
    }
}

/// Returns `true` for records that exist in only one snapshot.
pub fn is_creation_or_removal(record: &ChangeRecord) -> bool {
    matches!(record.change_kind(), ChangeKind::Added | ChangeKind::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ChangeRecord {
        parse_summary_line(line, 1).unwrap()
    }

    #[test]
    fn plain_line_is_modified() {
        let rec = parse("3\t1\tsystem/bin/init");
        assert_eq!(rec.change_kind(), ChangeKind::Modified);
        assert_eq!(rec.old_path(), Some("system/bin/init"));
        assert_eq!(rec.new_path(), "system/bin/init");
        assert_eq!(rec.lines_added(), LineCount::Lines(3));
        assert_eq!(rec.lines_deleted(), LineCount::Lines(1));
    }

    #[test]
    fn non_text_counts_are_preserved() {
        let rec = parse("-\t-\tvendor/lib64/libsecure.so");
        assert_eq!(rec.lines_added(), LineCount::NonText);
        assert_eq!(rec.lines_deleted(), LineCount::NonText);
    }

    #[test]
    fn space_separated_fields_accepted() {
        let rec = parse("2 0 system/etc/hosts");
        assert_eq!(rec.new_path(), "system/etc/hosts");
    }

    #[test]
    fn null_device_old_side_is_added() {
        let rec = parse("10\t0\t/dev/null => system/bin/newd");
        assert_eq!(rec.change_kind(), ChangeKind::Added);
        assert_eq!(rec.old_path(), None);
        assert_eq!(rec.new_path(), "system/bin/newd");
    }

    #[test]
    fn null_device_new_side_is_deleted() {
        let rec = parse("0\t10\tsystem/bin/oldd => /dev/null");
        assert_eq!(rec.change_kind(), ChangeKind::Deleted);
        assert_eq!(rec.new_path(), "system/bin/oldd");
    }

    #[test]
    fn arrow_rename() {
        let rec = parse("0\t5\told/path/App.apk => new/path/App.apk");
        assert_eq!(rec.change_kind(), ChangeKind::Renamed);
        assert_eq!(rec.old_path(), Some("old/path/App.apk"));
        assert_eq!(rec.new_path(), "new/path/App.apk");
    }

    #[test]
    fn brace_rename() {
        let rec = parse("4\t4\tproduct/{priv-app => app}/Dialer/Dialer.apk");
        assert_eq!(rec.change_kind(), ChangeKind::Renamed);
        assert_eq!(rec.old_path(), Some("product/priv-app/Dialer/Dialer.apk"));
        assert_eq!(rec.new_path(), "product/app/Dialer/Dialer.apk");
    }

    #[test]
    fn identical_brace_sides_are_modified() {
        let rec = parse("1\t1\tetc/{a => a}/b");
        assert_eq!(rec.change_kind(), ChangeKind::Modified);
        assert_eq!(rec.new_path(), "etc/a/b");
    }

    #[test]
    fn undecodable_rename_is_modified() {
        let rec = parse("1\t1\ta => b => c");
        assert_eq!(rec.change_kind(), ChangeKind::Modified);
        assert_eq!(rec.new_path(), "a => b => c");
    }

    #[test]
    fn short_lines_are_malformed() {
        for line in ["", "5", "5\t2", "5\t2\t   "] {
            let err = parse_summary_line(line, 9).unwrap_err();
            assert!(
                matches!(err, FwdeltaError::MalformedLine { line: 9, .. }),
                "{line:?}"
            );
        }
    }

    #[test]
    fn bad_counts_are_malformed() {
        assert!(parse_summary_line("x\t2\tpath", 1).is_err());
        assert!(parse_summary_line("1\t-2\tpath", 1).is_err());
    }

    #[test]
    fn summary_skips_bad_lines_and_keeps_going() {
        let input = "\
1\t0\ta/b

broken line
-\t-\tc/d
2\t1
";
        let parsed = parse_summary(input);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped.len(), 2);
        assert_eq!(parsed.skipped[0].line_number, 3);
        assert_eq!(parsed.skipped[1].line_number, 5);
        assert!(parsed.skipped[1].reason.contains("found 2"));
    }

    #[test]
    fn unmarked_lines_keep_old_equal_to_new() {
        let input = "1\t1\tx/y\n-\t-\tz\n0\t0\tdeep/nested/path/file.bin\n";
        for rec in parse_summary(input).records {
            assert_eq!(rec.old_path(), Some(rec.new_path()));
            assert!(!is_creation_or_removal(&rec));
        }
    }
}
