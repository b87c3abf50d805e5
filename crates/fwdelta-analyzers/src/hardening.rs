//! Hardening property comparison between two binaries.
//!
//! Property values come from the hardening inspector as strings. Scalar
//! values are mapped to a verdict with a fixed vocabulary, and a change is
//! labeled by how the verdict moved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Value recorded for a property one side does not report. It is part of
/// the FAIL vocabulary, so a mitigation that disappears is a regression.
pub const MISSING_VALUE: &str = "missing";

const OK_VALUES: &[&str] = &["yes", "full", "enabled"];
const FAIL_VALUES: &[&str] = &["no", "partial", "none", "missing"];

/// Properties where a positive answer is the weaker configuration.
const INVERTED_PROPERTIES: &[&str] = &["rpath", "runpath", "symbols"];

/// Counters reported as signed deltas instead of verdicts.
const NUMERIC_PROPERTIES: &[&str] = &["fortified", "fortify-able", "fortifiable"];

/// Verdict of one hardening property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Mitigation present.
    Ok,
    /// Mitigation absent or weakened.
    Fail,
}

/// Map a property value to a verdict, honoring the property's polarity.
///
/// Returns `None` for values outside the fixed vocabulary.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::hardening::{verdict, Verdict};
///
/// assert_eq!(verdict("relro", "full"), Some(Verdict::Ok));
/// assert_eq!(verdict("canary", "no"), Some(Verdict::Fail));
/// assert_eq!(verdict("rpath", "yes"), Some(Verdict::Fail));
/// assert_eq!(verdict("pie", "DSO"), None);
/// ```
pub fn verdict(property: &str, value: &str) -> Option<Verdict> {
    let value = value.trim().to_ascii_lowercase();
    let base = if OK_VALUES.contains(&value.as_str()) {
        Verdict::Ok
    } else if FAIL_VALUES.contains(&value.as_str()) {
        Verdict::Fail
    } else {
        return None;
    };

    if INVERTED_PROPERTIES.contains(&property) {
        Some(match base {
            Verdict::Ok => Verdict::Fail,
            Verdict::Fail => Verdict::Ok,
        })
    } else {
        Some(base)
    }
}

/// Label of one property change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardeningChange {
    /// `OK → FAIL`.
    Regression,
    /// `FAIL → OK`.
    Improvement,
    /// Non-boolean counter changed.
    Informational,
    /// Any other transition, as `old → new`.
    Raw(String),
}

impl fmt::Display for HardeningChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardeningChange::Regression => write!(f, "OK → FAIL"),
            HardeningChange::Improvement => write!(f, "FAIL → OK"),
            HardeningChange::Informational => write!(f, "informational"),
            HardeningChange::Raw(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for HardeningChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardeningChange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "OK → FAIL" => HardeningChange::Regression,
            "FAIL → OK" => HardeningChange::Improvement,
            "informational" => HardeningChange::Informational,
            _ => HardeningChange::Raw(s),
        })
    }
}

/// One differing hardening property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardeningDifference {
    /// Property name as reported by the inspector.
    pub option: String,
    /// Value in the old binary.
    pub old: String,
    /// Value in the new binary.
    pub new: String,
    /// Transition label.
    pub change: HardeningChange,
    /// Signed delta for numeric counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
}

/// Hardening comparison of two binaries.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use fwdelta_analyzers::hardening::{HardeningChange, HardeningDiff};
///
/// let old = BTreeMap::from([("nx".to_string(), "yes".to_string())]);
/// let new = BTreeMap::from([("nx".to_string(), "no".to_string())]);
/// let diff = HardeningDiff::compare(&old, &new);
/// assert!(!diff.identical);
/// assert_eq!(diff.differences[0].change, HardeningChange::Regression);
/// assert_eq!(diff.differences[0].change.to_string(), "OK → FAIL");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardeningDiff {
    /// No property differs.
    pub identical: bool,
    /// Differing properties, sorted by name.
    #[serde(default)]
    pub differences: Vec<HardeningDifference>,
}

impl Default for HardeningDiff {
    fn default() -> Self {
        Self {
            identical: true,
            differences: Vec::new(),
        }
    }
}

impl HardeningDiff {
    /// Compare two property maps over the union of their keys.
    pub fn compare(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Self {
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        let mut differences = Vec::new();

        for key in keys {
            let old_value = old.get(key).map_or(MISSING_VALUE, String::as_str);
            let new_value = new.get(key).map_or(MISSING_VALUE, String::as_str);
            if old_value == new_value {
                continue;
            }
            let (change, extra_info) = classify_change(key, old_value, new_value);
            differences.push(HardeningDifference {
                option: key.clone(),
                old: old_value.to_string(),
                new: new_value.to_string(),
                change,
                extra_info,
            });
        }

        Self {
            identical: differences.is_empty(),
            differences,
        }
    }

    /// Number of `OK → FAIL` transitions.
    pub fn regressions(&self) -> usize {
        self.differences
            .iter()
            .filter(|d| d.change == HardeningChange::Regression)
            .count()
    }
}

fn classify_change(property: &str, old: &str, new: &str) -> (HardeningChange, Option<String>) {
    if NUMERIC_PROPERTIES.contains(&property) {
        let delta = match (old.trim().parse::<i64>(), new.trim().parse::<i64>()) {
            (Ok(a), Ok(b)) => Some(format!("delta: {:+}", b - a)),
            _ => None,
        };
        return (HardeningChange::Informational, delta);
    }

    match (verdict(property, old), verdict(property, new)) {
        (Some(Verdict::Ok), Some(Verdict::Fail)) => (HardeningChange::Regression, None),
        (Some(Verdict::Fail), Some(Verdict::Ok)) => (HardeningChange::Improvement, None),
        _ => (HardeningChange::Raw(format!("{old} → {new}")), None),
    }
}

impl fmt::Display for HardeningDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identical {
            return write!(f, "hardening identical");
        }
        let parts: Vec<String> = self
            .differences
            .iter()
            .map(|d| match &d.extra_info {
                Some(extra) => format!("{} {} ({extra})", d.option, d.change),
                None => format!("{} {}", d.option, d.change),
            })
            .collect();
        write!(f, "hardening: {}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn nx_regression_is_ok_to_fail() {
        let diff = HardeningDiff::compare(&props(&[("nx", "yes")]), &props(&[("nx", "no")]));
        assert_eq!(diff.differences.len(), 1);
        assert_eq!(diff.differences[0].option, "nx");
        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json["differences"][0]["change"], "OK → FAIL");
        assert_eq!(diff.regressions(), 1);
    }

    #[test]
    fn relro_partial_to_full_is_improvement() {
        let diff = HardeningDiff::compare(
            &props(&[("relro", "partial")]),
            &props(&[("relro", "full")]),
        );
        assert_eq!(diff.differences[0].change, HardeningChange::Improvement);
    }

    #[test]
    fn inverted_properties_flip_polarity() {
        let diff = HardeningDiff::compare(&props(&[("runpath", "no")]), &props(&[("runpath", "yes")]));
        assert_eq!(diff.differences[0].change, HardeningChange::Regression);
    }

    #[test]
    fn numeric_counters_are_informational_with_delta() {
        let diff = HardeningDiff::compare(
            &props(&[("fortified", "7"), ("fortify-able", "12")]),
            &props(&[("fortified", "4"), ("fortify-able", "15")]),
        );
        assert_eq!(diff.differences.len(), 2);
        let fortified = diff.differences.iter().find(|d| d.option == "fortified").unwrap();
        assert_eq!(fortified.change, HardeningChange::Informational);
        assert_eq!(fortified.extra_info.as_deref(), Some("delta: -3"));
        let able = diff.differences.iter().find(|d| d.option == "fortify-able").unwrap();
        assert_eq!(able.extra_info.as_deref(), Some("delta: +3"));
    }

    #[test]
    fn unknown_values_are_raw() {
        let diff = HardeningDiff::compare(&props(&[("pie", "DSO")]), &props(&[("pie", "PIE enabled")]));
        let pie = &diff.differences[0];
        assert_eq!(pie.change.to_string(), "DSO → PIE enabled");
    }

    #[test]
    fn property_dropped_from_new_report_is_regression() {
        let diff = HardeningDiff::compare(&props(&[("canary", "yes"), ("nx", "yes")]), &props(&[("nx", "yes")]));
        assert_eq!(diff.differences.len(), 1);
        let canary = &diff.differences[0];
        assert_eq!(canary.option, "canary");
        assert_eq!(canary.new, MISSING_VALUE);
        assert_eq!(canary.change, HardeningChange::Regression);
    }

    #[test]
    fn property_appearing_in_new_report_is_improvement() {
        let diff = HardeningDiff::compare(&props(&[]), &props(&[("canary", "yes")]));
        assert_eq!(diff.differences[0].old, "missing");
        assert_eq!(diff.differences[0].change, HardeningChange::Improvement);

        // no rpath at all is the stronger configuration
        let diff = HardeningDiff::compare(&props(&[("rpath", "yes")]), &props(&[]));
        assert_eq!(diff.differences[0].change, HardeningChange::Improvement);
    }

    #[test]
    fn identical_maps_have_no_differences() {
        let p = props(&[("nx", "yes"), ("pie", "yes")]);
        let diff = HardeningDiff::compare(&p, &p);
        assert!(diff.identical);
        assert_eq!(diff, HardeningDiff::default());
        assert_eq!(diff.to_string(), "hardening identical");
    }

    #[test]
    fn change_labels_round_trip_through_json() {
        for change in [
            HardeningChange::Regression,
            HardeningChange::Improvement,
            HardeningChange::Informational,
            HardeningChange::Raw("a → b".into()),
        ] {
            let json = serde_json::to_string(&change).unwrap();
            let back: HardeningChange = serde_json::from_str(&json).unwrap();
            assert_eq!(back, change);
        }
    }
}
