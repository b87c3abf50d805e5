//! Kernel configuration hardening diff.
//!
//! Consumes two kernel hardening checker reports. Each relevant line names a
//! `CONFIG_*` option and ends its check column with `OK` or `FAIL`:
//!
//! ```text
//! CONFIG_STACKPROTECTOR   |kconfig|     y      |defconfig | self_protection  | OK
//! CONFIG_DEBUG_FS         |kconfig| is not set |    grsec | cut_attack_surface | FAIL: "y"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::hardening::{HardeningChange, Verdict};

static CHECK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(CONFIG_\S+|\S+CONFIG_\S+)\s+\|.*?\|\s+(OK|FAIL)").expect("check line regex is valid")
});

/// Parse a checker report into option -> verdict.
///
/// Lines that are not option checks are ignored. A repeated option keeps its
/// last verdict.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::hardening::Verdict;
/// use fwdelta_analyzers::kernel::parse_checker_output;
///
/// let report = "\
/// [+] Special report mode: none
/// CONFIG_BUG       |kconfig| y |defconfig | self_protection | OK
/// CONFIG_DEBUG_FS  |kconfig| is not set |grsec | cut_attack_surface | FAIL: \"y\"
/// ";
/// let map = parse_checker_output(report);
/// assert_eq!(map.len(), 2);
/// assert_eq!(map["CONFIG_DEBUG_FS"], Verdict::Fail);
/// ```
pub fn parse_checker_output(report: &str) -> BTreeMap<String, Verdict> {
    report
        .lines()
        .filter_map(|line| {
            let caps = CHECK_LINE_RE.captures(line.trim())?;
            let verdict = match &caps[2] {
                "OK" => Verdict::Ok,
                _ => Verdict::Fail,
            };
            Some((caps[1].trim().to_string(), verdict))
        })
        .collect()
}

/// One option whose verdict flipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelOptionChange {
    /// Configuration option name.
    pub option: String,
    /// `OK → FAIL` or `FAIL → OK`.
    pub change: HardeningChange,
}

/// Options that flipped between two checker reports, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KernelHardeningDiff {
    /// Options that regressed.
    pub ok_to_fail: Vec<KernelOptionChange>,
    /// Options that improved.
    pub fail_to_ok: Vec<KernelOptionChange>,
}

impl KernelHardeningDiff {
    /// Compare two parsed reports.
    ///
    /// Options present on one side only are not reported.
    pub fn compare(before: &BTreeMap<String, Verdict>, after: &BTreeMap<String, Verdict>) -> Self {
        let options: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        let mut diff = Self::default();

        for option in options {
            match (before.get(option), after.get(option)) {
                (Some(Verdict::Ok), Some(Verdict::Fail)) => diff.ok_to_fail.push(KernelOptionChange {
                    option: option.clone(),
                    change: HardeningChange::Regression,
                }),
                (Some(Verdict::Fail), Some(Verdict::Ok)) => diff.fail_to_ok.push(KernelOptionChange {
                    option: option.clone(),
                    change: HardeningChange::Improvement,
                }),
                _ => {}
            }
        }

        diff
    }

    /// Parse both reports and compare them.
    pub fn from_reports(before: &str, after: &str) -> Self {
        Self::compare(&parse_checker_output(before), &parse_checker_output(after))
    }

    /// Returns `true` if no option flipped.
    pub fn is_empty(&self) -> bool {
        self.ok_to_fail.is_empty() && self.fail_to_ok.is_empty()
    }
}

impl fmt::Display for KernelHardeningDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No kernel hardening changes.");
        }
        for c in self.ok_to_fail.iter().chain(&self.fail_to_ok) {
            writeln!(f, "{:<40} {}", c.option, c.change)?;
        }
        Ok(())
    }
}
